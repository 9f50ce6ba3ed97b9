/// Liveness watchdog for the receiving side of the file stream.
///
/// Every completed fixed-size read sets the shared activity flag. Once per
/// interval the watchdog takes the flag; if nothing was read since the last
/// look, the connection is declared stalled and `on_stall` runs (the
/// receiver sends its distress code and closes the socket from there).
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

/// Blocks until stopped or stalled. Returns `true` if `on_stall` ran.
///
/// Sending on, or dropping the sender of, `stop` ends the watch.
pub fn watch(
    interval: Duration,
    activity: &AtomicBool,
    stop: &Receiver<()>,
    on_stall: impl FnOnce(),
) -> bool {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if !activity.swap(false, Ordering::AcqRel) {
                    on_stall();
                    return true;
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn silent_connection_stalls_after_one_interval() {
        let activity = AtomicBool::new(false);
        let (_stop_tx, stop_rx) = bounded::<()>(1);
        let mut fired = false;

        let started = Instant::now();
        let stalled = watch(Duration::from_millis(50), &activity, &stop_rx, || fired = true);

        assert!(stalled);
        assert!(fired);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn steady_reads_keep_it_alive_until_stopped() {
        let activity = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let feeder_activity = activity.clone();
        let feeder = std::thread::spawn(move || {
            for _ in 0..30 {
                feeder_activity.store(true, Ordering::Release);
                std::thread::sleep(Duration::from_millis(10));
            }
            drop(stop_tx);
        });

        let stalled = watch(Duration::from_millis(100), &activity, &stop_rx, || {
            panic!("stalled while data was flowing")
        });
        assert!(!stalled);
        feeder.join().unwrap();
    }
}
