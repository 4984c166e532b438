// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Signal handling and TTY job-control discipline.
//!
//! Handlers only ever store to the process-wide atomic cells below or make
//! async-signal-safe calls (open, dup, dup2, close, raise, clock_gettime,
//! tcgetattr/tcsetattr).  The loop reads the cells between iterations; the
//! full state record never becomes reachable from a handler.

use crate::cursor::CursorShared;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use pmcommon::{clock, term};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

static TERMINAL_RESIZED: AtomicBool = AtomicBool::new(false);
static TRIGGER_EXIT: AtomicBool = AtomicBool::new(false);
static RXUSR2: AtomicBool = AtomicBool::new(false);
static USR2_SENDER: AtomicI32 = AtomicI32::new(0);
/// Instant SIGTSTP was received, in monotonic nanoseconds; 0 when not
/// currently stopped.
static TSTP_TIME_NS: AtomicU64 = AtomicU64::new(0);
/// Cumulative time spent stopped, in nanoseconds.
static TOFFSET_NS: AtomicU64 = AtomicU64::new(0);
/// Saved duplicate of standard error while it is redirected to /dev/null;
/// -1 when no redirect is active.
static OLD_STDERR: AtomicI32 = AtomicI32::new(-1);
/// Whether we were the ones to set TOSTOP on the terminal.
static TOSTOP_ADDED: AtomicBool = AtomicBool::new(false);
/// Countdown requesting cursor-coordinator reinitialisation.
static CURSOR_REINIT: AtomicI32 = AtomicI32::new(0);
/// The cursor coordinator's shared segment, when attached, so TOSTOP
/// propagation also reaches the other instances.
static CURSOR_SHARED: AtomicPtr<CursorShared> = AtomicPtr::new(std::ptr::null_mut());
static CURSOR_MODE: AtomicBool = AtomicBool::new(false);
/// Monotonic nanosecond deadline for the next background-recovery check.
static NEXT_BG_CHECK_NS: AtomicU64 = AtomicU64::new(0);

/// Dispositions saved at init time, restored by [`fini`].
static OLD_ACTIONS: Mutex<Vec<(Signal, SigAction)>> = Mutex::new(Vec::new());

/// Ensure the terminal's TOSTOP attribute is set so a backgrounded write
/// raises SIGTTOU, remembering whether we were the ones to change it.
fn ensure_tty_tostop() {
    // Safety: zeroed termios is a valid out-parameter for tcgetattr.
    let mut attrs: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(term::STDERR_FD, &mut attrs) } != 0 {
        return;
    }
    if attrs.c_lflag & libc::TOSTOP != 0 {
        return;
    }
    attrs.c_lflag |= libc::TOSTOP;
    // Safety: attrs was populated by tcgetattr above.
    if unsafe { libc::tcsetattr(term::STDERR_FD, libc::TCSANOW, &attrs) } == 0 {
        TOSTOP_ADDED.store(true, SeqCst);
        // Let the other coordinated instances know, so the last one out
        // can clear the attribute.
        let shared = CURSOR_SHARED.load(SeqCst);
        if CURSOR_MODE.load(SeqCst) && !shared.is_null() {
            // Safety: the pointer stays valid until unregistered.
            unsafe { (*shared).tty_tostop_added.store(true, SeqCst) };
        }
    }
}

/// SIGTTOU: redirect standard error to /dev/null, keeping the previous
/// descriptor so SIGCONT (or the periodic check) can restore it, so the
/// process can be backgrounded without corrupting the terminal.
extern "C" fn handle_ttou(_signum: libc::c_int) {
    // Safety: open/dup/dup2/close are async-signal-safe.
    unsafe {
        let fd = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if fd < 0 {
            return;
        }
        if OLD_STDERR.load(SeqCst) == -1 {
            OLD_STDERR.store(libc::dup(term::STDERR_FD), SeqCst);
        }
        libc::dup2(fd, term::STDERR_FD);
        libc::close(fd);
    }
}

/// SIGTSTP: record when we were stopped, then actually stop.
extern "C" fn handle_tstp(_signum: libc::c_int) {
    TSTP_TIME_NS.store(clock::read_ns_sigsafe(), SeqCst);
    // Safety: raise is async-signal-safe.
    unsafe { libc::raise(libc::SIGSTOP) };
}

/// SIGCONT: fold the stopped time into the offset, restore standard error
/// if it was redirected, re-query the terminal, and re-assert TOSTOP.
extern "C" fn handle_cont(_signum: libc::c_int) {
    TERMINAL_RESIZED.store(true, SeqCst);

    let stopped_at = TSTP_TIME_NS.swap(0, SeqCst);
    if stopped_at != 0 {
        let now = clock::read_ns_sigsafe();
        TOFFSET_NS.fetch_add(now.saturating_sub(stopped_at), SeqCst);
    }

    let old = OLD_STDERR.swap(-1, SeqCst);
    if old != -1 {
        // Safety: dup2/close are async-signal-safe.
        unsafe {
            libc::dup2(old, term::STDERR_FD);
            libc::close(old);
        }
    }

    ensure_tty_tostop();
    request_cursor_reinit();
}

extern "C" fn handle_winch(_signum: libc::c_int) {
    TERMINAL_RESIZED.store(true, SeqCst);
}

extern "C" fn handle_term(_signum: libc::c_int) {
    TRIGGER_EXIT.store(true, SeqCst);
}

fn note_usr2(sender: i32) {
    USR2_SENDER.store(sender, SeqCst);
    RXUSR2.store(true, SeqCst);
}

/// SIGUSR2 with SA_SIGINFO: remember who poked us.
extern "C" fn handle_usr2(
    _signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    if info.is_null() {
        return;
    }
    // Safety: the kernel hands a valid siginfo to an SA_SIGINFO handler.
    note_usr2(unsafe { (*info).si_pid() });
}

fn install(signal: Signal, action: &SigAction) {
    // Safety: the handlers above only touch atomics and make
    // async-signal-safe calls.
    match unsafe { sigaction(signal, action) } {
        Ok(previous) => {
            if let Ok(mut saved) = OLD_ACTIONS.lock() {
                saved.push((signal, previous));
            }
        }
        Err(e) => debug!("sigaction {signal:?} failed: {e}"),
    }
}

/// Install the signal handler set and assert TOSTOP on the terminal.
pub fn init(cursor_mode: bool) {
    CURSOR_MODE.store(cursor_mode, SeqCst);

    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let ttou = SigAction::new(
        SigHandler::Handler(handle_ttou),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let tstp = SigAction::new(
        SigHandler::Handler(handle_tstp),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let cont = SigAction::new(
        SigHandler::Handler(handle_cont),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let winch = SigAction::new(
        SigHandler::Handler(handle_winch),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let quit = SigAction::new(
        SigHandler::Handler(handle_term),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let usr2 = SigAction::new(
        SigHandler::SigAction(handle_usr2),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );

    // EPIPE from the write path is how downstream closure is noticed;
    // SIGPIPE itself must never kill us.
    install(Signal::SIGPIPE, &ignore);
    install(Signal::SIGTTOU, &ttou);
    install(Signal::SIGTSTP, &tstp);
    install(Signal::SIGCONT, &cont);
    install(Signal::SIGWINCH, &winch);
    install(Signal::SIGINT, &quit);
    install(Signal::SIGHUP, &quit);
    install(Signal::SIGTERM, &quit);
    install(Signal::SIGUSR2, &usr2);

    ensure_tty_tostop();
}

/// Restore the saved dispositions and, when appropriate, clear the TOSTOP
/// attribute we added.  Under the cursor coordinator the attribute is left
/// alone unless we are the last instance; this check is best-effort.
pub fn fini(cursor_mode: bool, cursor_attach_count: i32) {
    if let Ok(mut saved) = OLD_ACTIONS.lock() {
        for (signal, action) in saved.drain(..) {
            // Safety: restoring previously saved dispositions.
            let _ = unsafe { sigaction(signal, &action) };
        }
    }

    let mut need_clear = TOSTOP_ADDED.load(SeqCst);
    if cursor_mode && cursor_attach_count > 1 {
        need_clear = false;
    }

    if need_clear && term::in_foreground() {
        // Safety: as in ensure_tty_tostop().
        let mut attrs: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(term::STDERR_FD, &mut attrs) } == 0
            && attrs.c_lflag & libc::TOSTOP != 0
        {
            attrs.c_lflag &= !libc::TOSTOP;
            // Safety: attrs was populated by tcgetattr above.
            unsafe { libc::tcsetattr(term::STDERR_FD, libc::TCSANOW, &attrs) };
        }
        TOSTOP_ADDED.store(false, SeqCst);
    }
}

/// Stop reacting to SIGTSTP/SIGCONT, for the window where the start time
/// is being reset and a stop would corrupt the offset accounting.
pub fn no_pause() {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // Safety: plain disposition changes.
    unsafe {
        let _ = sigaction(Signal::SIGTSTP, &ignore);
        let _ = sigaction(Signal::SIGCONT, &default);
    }
}

/// Start catching SIGTSTP/SIGCONT again.
pub fn allow_pause() {
    let tstp = SigAction::new(
        SigHandler::Handler(handle_tstp),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let cont = SigAction::new(
        SigHandler::Handler(handle_cont),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Safety: as in init().
    unsafe {
        let _ = sigaction(Signal::SIGTSTP, &tstp);
        let _ = sigaction(Signal::SIGCONT, &cont);
    }
}

/// Called each tick: roughly once a second, if standard error was
/// redirected by SIGTTOU, try putting it back; this is how the display
/// recovers after a background/foreground round trip.
pub fn check_background() {
    let now = clock::read().as_nanos() as u64;
    if now < NEXT_BG_CHECK_NS.load(SeqCst) {
        return;
    }
    NEXT_BG_CHECK_NS.store(now + 1_000_000_000, SeqCst);

    let old = OLD_STDERR.swap(-1, SeqCst);
    if old == -1 {
        return;
    }
    // Safety: dup2/close on saved descriptors.
    unsafe {
        libc::dup2(old, term::STDERR_FD);
        libc::close(old);
    }
    ensure_tty_tostop();
    request_cursor_reinit();
}

/// True once an exit signal has been received.
pub fn exit_triggered() -> bool {
    TRIGGER_EXIT.load(SeqCst)
}

/// Consume the terminal-resized flag.
pub fn take_terminal_resized() -> bool {
    TERMINAL_RESIZED.swap(false, SeqCst)
}

pub fn set_terminal_resized() {
    TERMINAL_RESIZED.store(true, SeqCst);
}

/// Consume a received SIGUSR2, returning the sender's PID.
pub fn take_usr2() -> Option<i32> {
    if RXUSR2.swap(false, SeqCst) {
        Some(USR2_SENDER.load(SeqCst))
    } else {
        None
    }
}

/// Total time spent stopped, for elapsed-time correction.
pub fn stopped_offset() -> Duration {
    Duration::from_nanos(TOFFSET_NS.load(SeqCst))
}

/// Zero the stopped-time offset (wait-for-data start reset).
pub fn clear_stopped_offset() {
    TOFFSET_NS.store(0, SeqCst);
    TSTP_TIME_NS.store(0, SeqCst);
}

/// Ask the cursor coordinator to re-acquire its row.
pub fn request_cursor_reinit() {
    let _ = CURSOR_REINIT.fetch_update(SeqCst, SeqCst, |v| Some((v + 2).min(3)));
}

pub fn cursor_reinit_pending() -> i32 {
    CURSOR_REINIT.load(SeqCst)
}

/// One reinitialisation step was performed.
pub fn cursor_reinit_step() -> i32 {
    CURSOR_REINIT.fetch_sub(1, SeqCst) - 1
}

pub fn cursor_reinit_clear() {
    CURSOR_REINIT.store(0, SeqCst);
}

/// Whether we had to add TOSTOP to the terminal.
pub fn tostop_added() -> bool {
    TOSTOP_ADDED.load(SeqCst)
}

pub fn set_tostop_added(value: bool) {
    TOSTOP_ADDED.store(value, SeqCst);
}

/// Make the cursor coordinator's shared segment reachable for TOSTOP
/// propagation from the signal path.
pub fn register_cursor_shared(shared: *mut CursorShared) {
    CURSOR_SHARED.store(shared, SeqCst);
}

pub fn unregister_cursor_shared() {
    CURSOR_SHARED.store(std::ptr::null_mut(), SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usr2_take_consumes() {
        // Other tests drive loops that also consume this process-wide
        // flag; retry until our own set/take pair wins the race.
        for _ in 0..100 {
            note_usr2(4242);
            if let Some(sender) = take_usr2() {
                assert_eq!(sender, 4242);
                return;
            }
        }
        panic!("SIGUSR2 flag never survived to be consumed");
    }

    // The flag cells are process-wide, so the handler-driven checks run as
    // one sequential test to keep them deterministic.
    #[test]
    fn test_handler_flag_accounting() {
        handle_winch(libc::SIGWINCH);
        assert!(take_terminal_resized());

        cursor_reinit_clear();
        request_cursor_reinit();
        assert_eq!(cursor_reinit_pending(), 2);
        request_cursor_reinit();
        assert_eq!(cursor_reinit_pending(), 3);
        request_cursor_reinit();
        assert_eq!(cursor_reinit_pending(), 3);
        cursor_reinit_step();
        assert_eq!(cursor_reinit_pending(), 2);
        cursor_reinit_clear();
        assert_eq!(cursor_reinit_pending(), 0);

        // Simulate SIGTSTP having been delivered a little while ago, then
        // the matching SIGCONT folding the stopped time into the offset.
        clear_stopped_offset();
        let now = clock::read_ns_sigsafe();
        TSTP_TIME_NS.store(now - 50_000_000, SeqCst);
        handle_cont(libc::SIGCONT);
        let offset = stopped_offset();
        assert!(offset >= Duration::from_millis(50));
        assert!(offset < Duration::from_secs(5));
        clear_stopped_offset();
        assert_eq!(stopped_offset(), Duration::ZERO);
        cursor_reinit_clear();
    }
}
