// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The display engine: parses a format string into segments once, renders
//! each required component into a reused scratch string per tick, sizes the
//! progress bar to the space the static parts leave over, and assembles the
//! final line within the terminal width.

use crate::cursor::CursorContext;
use crate::history::RateHistory;
use crate::signals;
use crate::state::State;
use crate::{FORMAT_SEGMENT_MAX, LASTOUTPUT_MAX};
use pmcommon::term::{self, STDERR_FD};
use std::fmt::Write as _;

/// Display components a format segment can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Component {
    /// `%p`: progress bar, with percentage when the size is known.
    Progress = 0,
    /// `%b`: bytes (or bits, or lines) transferred.
    Bytes,
    /// `%t`: elapsed time.
    Timer,
    /// `%r`: instantaneous rate.
    Rate,
    /// `%a`: smoothed average rate.
    AverageRate,
    /// `%e`: estimated time remaining.
    Eta,
    /// `%I`: estimated wall-clock time of completion.
    FinEta,
    /// `%N`: name prefix.
    Name,
    /// `%T`: transfer-buffer utilisation.
    BufPercent,
    /// `%<N>A`: last N bytes written.
    OutputBuf,
}

pub const COMPONENT_COUNT: usize = 10;

const ALL_COMPONENTS: [Component; COMPONENT_COUNT] = [
    Component::Progress,
    Component::Bytes,
    Component::Timer,
    Component::Rate,
    Component::AverageRate,
    Component::Eta,
    Component::FinEta,
    Component::Name,
    Component::BufPercent,
    Component::OutputBuf,
];

/// One parsed piece of the format string.
#[derive(Debug, Clone, Copy)]
enum Segment {
    /// A literal slice of the format string, by byte offset and length.
    Literal { start: usize, len: usize },
    Reference(Component),
}

/// Whether a quantity scales in powers of 1024 (bytes) or 1000.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountKind {
    Bytes,
    Other,
}

/// Mutable display state: the parsed format, per-component scratch
/// strings, rate bookkeeping and the output line buffer.
#[derive(Debug)]
pub struct DisplayState {
    /// The assembled output line.
    pub buffer: String,
    /// Length of the previously emitted line, for erase-tail padding.
    last_line_len: usize,
    prev_screen_width: u32,
    /// True once anything has been written to the terminal.
    pub visible: bool,
    /// Percentage complete; wraps within [0, 200) as a liveness ticker
    /// when the total size is unknown.
    pub percentage: i64,
    prev_elapsed_sec: f64,
    prev_rate: f64,
    prev_trans: f64,
    pub history: RateHistory,
    /// Byte offset already transferred when we attached (watch modes).
    pub initial_offset: u64,
    /// How many recently written bytes `%A` shows.
    pub lastoutput_length: usize,
    lastoutput: [u8; LASTOUTPUT_MAX],
    segments: Vec<Segment>,
    required: [bool; COMPONENT_COUNT],
    components: [String; COMPONENT_COUNT],
    /// Rebuild the segment list at the next tick.
    pub reparse: bool,
}

impl DisplayState {
    pub fn new() -> Self {
        DisplayState {
            buffer: String::new(),
            last_line_len: 0,
            prev_screen_width: 0,
            visible: false,
            percentage: 0,
            prev_elapsed_sec: 0.0,
            prev_rate: 0.0,
            prev_trans: 0.0,
            history: RateHistory::new(30),
            initial_offset: 0,
            lastoutput_length: 0,
            lastoutput: [0u8; LASTOUTPUT_MAX],
            segments: Vec::new(),
            required: [false; COMPONENT_COUNT],
            components: Default::default(),
            reparse: true,
        }
    }

    /// Replace the history ring for a new averaging window.
    pub fn reset_history(&mut self, window_sec: u32) {
        self.history = RateHistory::new(window_sec);
    }

    /// Whether a component is referenced by the current format.
    pub fn requires(&self, component: Component) -> bool {
        self.required[component as usize]
    }

    /// Fold freshly written bytes into the "last output" window.
    pub fn record_output(&mut self, written: &[u8]) {
        let window = self.lastoutput_length.min(LASTOUTPUT_MAX);
        if window == 0 {
            return;
        }
        let new_len = written.len().min(window);
        let keep = window - new_len;
        if keep > 0 {
            self.lastoutput.copy_within(new_len..new_len + keep, 0);
        }
        self.lastoutput[keep..window].copy_from_slice(&written[written.len() - new_len..]);
    }
}

impl Default for DisplayState {
    fn default() -> Self {
        Self::new()
    }
}

fn calc_percentage(so_far: i64, total: i64) -> i64 {
    if total < 1 {
        return 0;
    }
    so_far.saturating_mul(100) / total
}

/// Estimated seconds until completion given progress and a rate.
fn seconds_remaining(so_far: i64, total: i64, rate: f64) -> i64 {
    if so_far < 1 || rate < 0.001 {
        return 0;
    }
    ((total - so_far) as f64 / rate) as i64
}

fn bound(x: i64, min: i64, max: i64) -> i64 {
    x.clamp(min, max)
}

const PREFIXES_1000: &[u8; 17] = b"yzafpnum kMGTPEZY";
const PREFIXES_1024: &[u8; 17] = b"yzafpnum KMGTPEZY";
const PREFIX_MIDDLE: usize = 8;

/// Scale `value` into [1, ratio) (or as close as the prefix table allows)
/// and return the matching SI prefix: one character, or two in bytes mode
/// where `Ki`/`Mi`-style prefixes apply and "no prefix" is two spaces.
/// The cutoff for moving to the next prefix is a little below the ratio so
/// a value hovering at the boundary does not oscillate between prefixes.
fn si_prefix(value: &mut f64, ratio: f64, kind: CountKind) -> String {
    let table: &[u8; 17] = if kind == CountKind::Bytes {
        PREFIXES_1024
    } else {
        PREFIXES_1000
    };

    // Near-zero renders without a prefix letter, avoiding "0yB".
    if *value > -0.000_000_01 && *value < 0.000_000_01 {
        return if kind == CountKind::Bytes {
            "  ".to_string()
        } else {
            " ".to_string()
        };
    }

    let cutoff = ratio * 0.97;
    let mut idx = PREFIX_MIDDLE;

    if *value > 0.0 {
        while *value > cutoff && idx + 1 < table.len() {
            idx += 1;
            *value /= ratio;
        }
        while *value < 1.0 && idx > 0 {
            idx -= 1;
            *value *= ratio;
        }
    } else {
        while *value < -cutoff && idx + 1 < table.len() {
            idx += 1;
            *value /= ratio;
        }
        while *value > -1.0 && idx > 0 {
            idx -= 1;
            *value *= ratio;
        }
    }

    let letter = table[idx] as char;
    if kind == CountKind::Bytes {
        if letter == ' ' {
            "  ".to_string()
        } else {
            format!("{letter}i")
        }
    } else {
        letter.to_string()
    }
}

/// Format an amount as 3-4 significant digits, an SI prefix, and a unit
/// suffix; bytes scale by 1024 (`KiB`, `MiB`, ...), everything else by
/// 1000.
pub fn size_str(amount: f64, suffix_basic: &str, suffix_bytes: &str, kind: CountKind) -> String {
    let (ratio, suffix) = if kind == CountKind::Bytes {
        (1024.0, suffix_bytes)
    } else {
        (1000.0, suffix_basic)
    };

    let mut value = amount;
    let prefix = si_prefix(&mut value, ratio, kind);

    value = value.clamp(-100_000.0, 100_000.0);

    if value > 99.9 || value < -99.9 {
        format!("{:4}{}{}", value as i64, prefix, suffix)
    } else {
        let decimals = if value.abs() >= 10.0 {
            1
        } else if value.abs() >= 1.0 {
            2
        } else {
            3
        };
        format!("{value:>4.decimals$}{prefix}{suffix}")
    }
}

/// Render elapsed-style seconds as `h:mm:ss`, with a leading day count
/// once the value passes a day.
fn time_str(total_sec: i64) -> String {
    if total_sec > 86_400 {
        format!(
            "{}:{:02}:{:02}:{:02}",
            total_sec / 86_400,
            (total_sec / 3_600) % 24,
            (total_sec / 60) % 60,
            total_sec % 60
        )
    } else {
        format!(
            "{}:{:02}:{:02}",
            total_sec / 3_600,
            (total_sec / 60) % 60,
            total_sec % 60
        )
    }
}

/// Parse the effective format string into the segment list and mark the
/// components it references as required.
pub fn format_init(state: &mut State) {
    let State {
        control, display, ..
    } = state;

    display.segments.clear();
    display.required = [false; COMPONENT_COUNT];
    for content in display.components.iter_mut() {
        content.clear();
    }

    if let Some(name) = &control.name {
        let shown: String = name.chars().take(500).collect();
        let slot = &mut display.components[Component::Name as usize];
        let _ = write!(slot, "{shown:>9}:");
    }

    let formatstr = control.effective_format();
    let bytes = formatstr.as_bytes();
    let mut idx = 0;

    while idx < bytes.len() && display.segments.len() < FORMAT_SEGMENT_MAX {
        if b'%' == bytes[idx] {
            idx += 1;

            // An optional numeric prefix between the % and the format
            // character, used by %A.
            let digits_start = idx;
            while idx < bytes.len() && bytes[idx].is_ascii_digit() {
                idx += 1;
            }
            if idx >= bytes.len() {
                // Trailing "%" or "%<digits>" has nothing to apply to.
                break;
            }
            let number_prefix: usize = formatstr[digits_start..idx].parse().unwrap_or(0);

            let segment = match bytes[idx] {
                b'p' => Segment::Reference(Component::Progress),
                b't' => Segment::Reference(Component::Timer),
                b'e' => Segment::Reference(Component::Eta),
                b'I' => Segment::Reference(Component::FinEta),
                b'A' => {
                    display.lastoutput_length = number_prefix.clamp(1, LASTOUTPUT_MAX);
                    Segment::Reference(Component::OutputBuf)
                }
                b'r' => Segment::Reference(Component::Rate),
                b'a' => Segment::Reference(Component::AverageRate),
                b'b' => Segment::Reference(Component::Bytes),
                b'T' => Segment::Reference(Component::BufPercent),
                b'N' => Segment::Reference(Component::Name),
                b'%' => Segment::Literal { start: idx, len: 1 },
                _ => Segment::Literal {
                    start: idx - 1,
                    len: 2,
                },
            };
            if let Segment::Reference(component) = segment {
                display.required[component as usize] = true;
            }
            display.segments.push(segment);
            idx += 1;
        } else {
            let run = bytes[idx..]
                .iter()
                .position(|&b| b == b'%')
                .unwrap_or(bytes.len() - idx);
            display.segments.push(Segment::Literal {
                start: idx,
                len: run,
            });
            idx += run;
        }
    }
}

/// Build the output line for one tick.  `since_last` is the amount moved
/// since the previous update, or negative for the final update, in which
/// case rates become whole-run averages and the ETA is blanked.  In line
/// mode all amounts are lines rather than bytes.
///
/// Returns false if there is nothing to show.
pub fn format_line(state: &mut State, elapsed_sec: f64, since_last: i64, total: u64) -> bool {
    let State {
        control,
        display,
        transfer,
        ..
    } = state;

    let final_update = since_last < 0;

    // Rate smoothing across very small tick gaps: accumulate the amount
    // moved and reuse the previous rate until enough time has passed to
    // divide safely.
    let time_since_last = elapsed_sec - display.prev_elapsed_sec;
    let rate;
    if time_since_last <= 0.01 {
        rate = display.prev_rate;
        display.prev_trans += since_last as f64;
    } else {
        rate = (since_last as f64 + display.prev_trans) / time_since_last;
        display.prev_elapsed_sec = elapsed_sec;
        display.prev_trans = 0.0;
    }
    display.prev_rate = rate;

    display.history.update(total, elapsed_sec, rate);
    let mut average_rate = display.history.current_avg_rate;
    let mut rate = rate;

    if final_update {
        let elapsed = elapsed_sec.max(0.000_001);
        average_rate = (total as f64 - display.initial_offset as f64) / elapsed;
        rate = average_rate;
    }

    if control.size == 0 {
        // Unknown size: walk the percentage 0..199 and wrap, so the bar's
        // bouncing indicator keeps moving while data flows.
        if rate > 0.0 {
            display.percentage += 2;
        }
        if display.percentage > 199 {
            display.percentage = 0;
        }
    } else if control.numeric || display.requires(Component::Progress) {
        display.percentage = calc_percentage(total as i64, control.size as i64);
    }

    if control.numeric {
        display.buffer.clear();
        if display.requires(Component::Timer) {
            let _ = write!(display.buffer, "{elapsed_sec:.4} ");
        }
        if display.requires(Component::Bytes) {
            let count = if control.bits { total * 8 } else { total };
            let _ = writeln!(display.buffer, "{count}");
        } else {
            let _ = writeln!(display.buffer, "{}", display.percentage);
        }
        return true;
    }

    let count_kind = if control.linemode {
        CountKind::Other
    } else {
        CountKind::Bytes
    };

    for component in ALL_COMPONENTS {
        if !display.requires(component) || component == Component::Progress {
            continue;
        }

        let content = match component {
            Component::Bytes => {
                if control.bits && !control.linemode {
                    size_str(total as f64 * 8.0, "", "b", CountKind::Bytes)
                } else {
                    size_str(total as f64, "", "B", count_kind)
                }
            }
            Component::Timer => {
                // Cap so the rendering can never grow without bound; the
                // cap is over eleven years.
                let capped = elapsed_sec.min(360_000_000.0) as i64;
                time_str(capped)
            }
            Component::Rate => {
                if control.bits && !control.linemode {
                    format!("[{}]", size_str(8.0 * rate, "", "b/s", CountKind::Bytes))
                } else {
                    format!("[{}]", size_str(rate, "/s", "B/s", count_kind))
                }
            }
            Component::AverageRate => {
                if control.bits && !control.linemode {
                    format!(
                        "[{}]",
                        size_str(8.0 * average_rate, "", "b/s", CountKind::Bytes)
                    )
                } else {
                    format!("[{}]", size_str(average_rate, "/s", "B/s", count_kind))
                }
            }
            Component::Eta => {
                let eta = bound(
                    seconds_remaining(
                        total as i64 - display.initial_offset as i64,
                        control.size as i64 - display.initial_offset as i64,
                        display.history.current_avg_rate,
                    ),
                    0,
                    360_000_000,
                );
                let rendered = format!("ETA {}", time_str(eta));
                // Blanked, not omitted, to preserve column alignment: on
                // the final update, and whenever the size is unknown.
                if final_update || control.size == 0 {
                    " ".repeat(rendered.len())
                } else {
                    rendered
                }
            }
            Component::FinEta => {
                let eta = bound(
                    seconds_remaining(
                        total as i64 - display.initial_offset as i64,
                        control.size as i64 - display.initial_offset as i64,
                        display.history.current_avg_rate,
                    ),
                    0,
                    360_000_000,
                );
                // Include the date once the completion time is more than
                // six hours away.
                let time_format = if eta > 6 * 3600 {
                    "%Y-%m-%d %H:%M:%S"
                } else {
                    "%H:%M:%S"
                };
                let then = chrono::Local::now() + chrono::Duration::seconds(eta);
                let rendered = format!("ETA {}", then.format(time_format));
                if control.size == 0 {
                    " ".repeat(rendered.len())
                } else {
                    rendered
                }
            }
            Component::Name => display.components[Component::Name as usize].clone(),
            Component::BufPercent => {
                if transfer.splice_used {
                    "{----}".to_string()
                } else if transfer.buffer_size > 0 {
                    let used = calc_percentage(
                        (transfer.read_position - transfer.write_position) as i64,
                        transfer.buffer_size as i64,
                    );
                    format!("{{{used:3}%}}")
                } else {
                    String::new()
                }
            }
            Component::OutputBuf => display.lastoutput[..display.lastoutput_length]
                .iter()
                .map(|&b| {
                    if b.is_ascii_graphic() || b == b' ' {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect(),
            Component::Progress => unreachable!(),
        };

        display.components[component as usize] = content;
    }

    // Width consumed by everything except the progress bar.
    let formatstr = control.effective_format();
    let mut static_portion = 0usize;
    for segment in &display.segments {
        match *segment {
            Segment::Literal { len, .. } => static_portion += len,
            Segment::Reference(Component::Progress) => {}
            Segment::Reference(component) => {
                static_portion += display.components[component as usize].len()
            }
        }
    }

    if display.requires(Component::Progress) {
        let mut bar = String::with_capacity(control.width as usize + 8);
        bar.push('[');

        // Scratch space cap carried by the fixed component buffers.
        let width_cap = 1024 - 16;

        if control.size > 0 {
            let pct = display.percentage.clamp(0, 100_000);
            let pct_str = format!("{pct:3}%");

            let available = (control.width as i64 - static_portion as i64 - pct_str.len() as i64
                - 3)
            .clamp(0, width_cap) as usize;

            let fill = (((available as i64) * pct) / 100 - 1).max(0) as usize;
            let fill = fill.min(available);
            for _ in 0..fill {
                bar.push('=');
            }
            let mut used = fill;
            if used < available {
                bar.push('>');
                used += 1;
            }
            for _ in used..available {
                bar.push(' ');
            }
            bar.push_str("] ");
            bar.push_str(&pct_str);
        } else {
            let available =
                (control.width as i64 - static_portion as i64 - 5).clamp(0, width_cap) as usize;

            // The ticker walks 0..199; fold the top half back down so the
            // indicator bounces off the right edge.
            let mut indicator = display.percentage;
            if indicator > 100 {
                indicator = 200 - indicator;
            }

            let lead = ((available as i64 * indicator) / 100).clamp(0, available as i64) as usize;
            for _ in 0..lead {
                bar.push(' ');
            }
            bar.push_str("<=>");
            for _ in lead..available {
                bar.push(' ');
            }
            bar.push(']');
        }

        // Drop the bar entirely if it cannot fit.
        if bar.len() + static_portion > control.width as usize {
            bar.clear();
        }
        display.components[Component::Progress as usize] = bar;
    }

    display.buffer.clear();
    for segment in &display.segments {
        let piece: &str = match *segment {
            Segment::Literal { start, len } => &formatstr[start..start + len],
            Segment::Reference(component) => &display.components[component as usize],
        };
        if piece.is_empty() {
            continue;
        }
        if piece.len() + display.buffer.len() > control.width as usize {
            break;
        }
        display.buffer.push_str(piece);
    }

    // If the line shrank and the terminal did not, append spaces so stale
    // characters from the previous render are erased.
    let mut new_len = display.buffer.len();
    if new_len < display.last_line_len && control.width >= display.prev_screen_width {
        let pad = (display.last_line_len - new_len).min(15);
        for _ in 0..pad {
            display.buffer.push(' ');
        }
        new_len += pad;
    }

    display.last_line_len = new_len;
    display.prev_screen_width = control.width;

    true
}

/// Render and emit one display update.  `since_last` below zero marks the
/// final update.  In line mode the amounts are lines, not bytes.
pub fn display(
    state: &mut State,
    cursor: Option<&mut CursorContext>,
    elapsed_sec: f64,
    since_last: i64,
    total: u64,
) {
    if state.display.reparse {
        format_init(state);
        state.display.reparse = false;
    }

    signals::check_background();

    if !format_line(state, elapsed_sec, since_last, total) {
        return;
    }

    if state.control.numeric {
        term::write_retry(STDERR_FD, state.display.buffer.as_bytes());
        return;
    }

    if state.control.cursor {
        if let Some(ctx) = cursor {
            if state.control.force || term::in_foreground() {
                let State {
                    control, display, ..
                } = state;
                ctx.update(control, &display.buffer);
                display.visible = true;
            }
            return;
        }
    }

    if state.control.force || term::in_foreground() {
        term::write_retry(STDERR_FD, state.display.buffer.as_bytes());
        term::write_retry(STDERR_FD, b"\r");
        state.display.visible = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    fn test_state(format: &str, width: u32) -> State {
        let mut state = State::new("pipemon");
        state.control.format_string = Some(format.to_string());
        state.control.width = width;
        state.control.force = true;
        format_init(&mut state);
        state.display.reparse = false;
        state
    }

    #[test]
    fn test_literal_only_format_renders_exactly() {
        let mut state = test_state("copying data", 80);
        assert!(format_line(&mut state, 1.0, 100, 100));
        assert_eq!(state.display.buffer, "copying data");
    }

    #[test]
    fn test_literal_truncated_to_width() {
        let mut state = test_state("abcdefghij", 5);
        assert!(format_line(&mut state, 1.0, 0, 0));
        assert!(state.display.buffer.len() <= 5);
    }

    #[test]
    fn test_percent_escape() {
        let mut state = test_state("100%% done", 80);
        assert!(format_line(&mut state, 1.0, 0, 0));
        assert_eq!(state.display.buffer, "100% done");
    }

    #[test]
    fn test_unknown_token_passes_through() {
        let mut state = test_state("%z", 80);
        assert!(format_line(&mut state, 1.0, 0, 0));
        assert_eq!(state.display.buffer, "%z");
    }

    #[test]
    fn test_trailing_percent_is_dropped() {
        let mut state = test_state("done%", 80);
        assert!(format_line(&mut state, 1.0, 0, 0));
        assert_eq!(state.display.buffer, "done");
    }

    #[test]
    fn test_si_scaling_bytes() {
        assert_eq!(size_str(0.0, "", "B", CountKind::Bytes), "0.000  B");
        assert_eq!(size_str(500.0, "", "B", CountKind::Bytes), " 500  B");
        assert_eq!(size_str(2048.0, "", "B", CountKind::Bytes), "2.00KiB");
        assert_eq!(size_str(1536.0, "", "B", CountKind::Bytes), "1.50KiB");
        assert_eq!(
            size_str(10.0 * 1024.0 * 1024.0, "", "B", CountKind::Bytes),
            "10.0MiB"
        );
    }

    #[test]
    fn test_si_scaling_rates_use_1000() {
        assert_eq!(size_str(2000.0, "/s", "B/s", CountKind::Other), "2.00k/s");
    }

    #[test]
    fn test_si_near_zero_has_no_prefix_letter() {
        let s = size_str(0.0000000001, "", "B", CountKind::Bytes);
        assert!(s.ends_with("  B"), "got {s:?}");
        assert!(!s.contains('y'));
    }

    #[test]
    fn test_si_boundary_hover_stays_unprefixed() {
        // Values just under the ratio are promoted by the cutoff walk and
        // then walked back down, so they render without a prefix rather
        // than flickering between "0.98KiB" and "1.00KiB".
        assert_eq!(size_str(1000.0, "", "B", CountKind::Bytes), "1000  B");
        assert_eq!(size_str(990.0, "", "B", CountKind::Bytes), " 990  B");
        assert_eq!(size_str(1100.0, "", "B", CountKind::Bytes), "1.07KiB");
    }

    #[test]
    fn test_bytes_component_500b() {
        let mut state = test_state("%b", 80);
        state.control.size = 500;
        assert!(format_line(&mut state, 1.0, 500, 500));
        assert_eq!(state.display.buffer, " 500  B");
    }

    #[test]
    fn test_timer_rolls_to_days() {
        let mut state = test_state("%t", 80);
        assert!(format_line(&mut state, 90_061.0, 0, 0));
        assert_eq!(state.display.buffer, "1:01:01:01");

        let mut fresh = test_state("%t", 80);
        assert!(format_line(&mut fresh, 3_661.0, 0, 0));
        assert_eq!(fresh.display.buffer, "1:01:01");
    }

    #[test]
    fn test_progress_bar_full_at_100_percent() {
        let mut state = test_state("%p", 40);
        state.control.size = 1000;
        assert!(format_line(&mut state, 2.0, 0, 1000));
        let line = &state.display.buffer;
        assert!(line.starts_with('['), "got {line:?}");
        assert!(line.ends_with("100%"), "got {line:?}");
        // The tip rides at the right edge of a full bar, with no gap.
        assert!(line.contains("=>] "), "got {line:?}");
    }

    #[test]
    fn test_progress_bar_partial_has_tip() {
        let mut state = test_state("%p", 40);
        state.control.size = 1000;
        assert!(format_line(&mut state, 2.0, 0, 500));
        let line = &state.display.buffer;
        assert!(line.contains('>'), "got {line:?}");
        assert!(line.ends_with(" 50%"), "got {line:?}");
    }

    #[test]
    fn test_unknown_size_bar_bounces() {
        let mut state = test_state("%p", 40);
        state.control.size = 0;
        assert!(format_line(&mut state, 1.0, 4096, 4096));
        let first = state.display.buffer.clone();
        assert!(first.contains("<=>"), "got {first:?}");
        // Drive the ticker forward; the indicator must move.
        let mut moved = false;
        for tick in 2..40 {
            assert!(format_line(&mut state, tick as f64, 4096, 4096 * tick));
            if state.display.buffer != first {
                moved = true;
                break;
            }
        }
        assert!(moved);
    }

    #[test]
    fn test_eta_blank_when_size_unknown() {
        let mut state = test_state("%e", 80);
        state.control.size = 0;
        assert!(format_line(&mut state, 1.0, 10, 10));
        assert!(!state.display.buffer.is_empty());
        assert!(state.display.buffer.chars().all(|c| c == ' '));
    }

    #[test]
    fn test_fineta_blank_when_size_unknown() {
        let mut state = test_state("%I", 80);
        state.control.size = 0;
        assert!(format_line(&mut state, 1.0, 10, 10));
        assert!(!state.display.buffer.is_empty());
        assert!(state.display.buffer.chars().all(|c| c == ' '));
    }

    #[test]
    fn test_eta_blank_on_final_update() {
        let mut state = test_state("%e", 80);
        state.control.size = 1000;
        assert!(format_line(&mut state, 1.0, 500, 500));
        let mid = state.display.buffer.clone();
        assert!(mid.starts_with("ETA "), "got {mid:?}");
        assert!(format_line(&mut state, 2.0, -1, 1000));
        assert_eq!(state.display.buffer.len(), mid.len());
        assert!(state.display.buffer.chars().all(|c| c == ' '));
    }

    #[test]
    fn test_numeric_mode_percentage() {
        let mut state = test_state("%p", 80);
        state.control.numeric = true;
        state.control.size = 200;
        assert!(format_line(&mut state, 1.0, 100, 100));
        assert_eq!(state.display.buffer, "50\n");
    }

    #[test]
    fn test_numeric_mode_bytes_with_timer_prefix() {
        let mut state = test_state("%t %b", 80);
        state.control.numeric = true;
        assert!(format_line(&mut state, 2.5, 100, 1234));
        assert_eq!(state.display.buffer, "2.5000 1234\n");
    }

    #[test]
    fn test_numeric_mode_bits() {
        let mut state = test_state("%b", 80);
        state.control.numeric = true;
        state.control.bits = true;
        assert!(format_line(&mut state, 1.0, 0, 100));
        assert_eq!(state.display.buffer, "800\n");
    }

    #[test]
    fn test_erase_tail_padding() {
        let mut state = test_state("%t", 80);
        assert!(format_line(&mut state, 90_061.0, 0, 0));
        assert_eq!(state.display.buffer.len(), 10);
        assert!(format_line(&mut state, 3_661.0, 0, 0));
        // The shorter line is padded with spaces so the previous render's
        // leftover characters are erased.
        assert_eq!(state.display.buffer, "1:01:01   ");
    }

    #[test]
    fn test_name_right_aligned() {
        let mut state = State::new("pipemon");
        state.control.format_string = Some("%N %b".to_string());
        state.control.width = 80;
        state.control.name = Some("tar".to_string());
        format_init(&mut state);
        assert!(format_line(&mut state, 1.0, 0, 0));
        assert!(state.display.buffer.starts_with("      tar:"));
    }

    #[test]
    fn test_lastoutput_window() {
        let mut state = test_state("%8A", 80);
        state.display.record_output(b"abc");
        state.display.record_output(b"defgh");
        assert!(format_line(&mut state, 1.0, 8, 8));
        assert_eq!(state.display.buffer, "abcdefgh");
    }

    #[test]
    fn test_lastoutput_nonprintable_dots() {
        let mut state = test_state("%4A", 80);
        state.display.record_output(&[b'a', 0x01, b'b', 0xff]);
        assert!(format_line(&mut state, 1.0, 4, 4));
        assert_eq!(state.display.buffer, "a.b.");
    }

    #[test]
    fn test_bufpercent_zero_copy_marker() {
        let mut state = test_state("%T", 80);
        state.transfer.splice_used = true;
        assert!(format_line(&mut state, 1.0, 0, 0));
        assert_eq!(state.display.buffer, "{----}");
    }

    #[test]
    fn test_unknown_size_percentage_wraps() {
        let mut state = test_state("%p", 40);
        state.control.size = 0;
        for tick in 1..=150 {
            assert!(format_line(&mut state, tick as f64, 1000, 1000 * tick));
            assert!(state.display.percentage >= 0 && state.display.percentage < 200);
        }
    }
}
