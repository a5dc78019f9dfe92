use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::thread;
use std::time::{Duration, Instant};

use super::{LogLine, LogLines, LogSink, LogStream};

/// Lines in flight between producers and the consumer. A full channel blocks
/// the producer.
pub(crate) const CHANNEL_CAPACITY: usize = 256;
/// Lines kept for `RunResult::logs`; older lines are dropped first.
pub(crate) const RETAINED_LINES: usize = 4096;
/// Once the producer has returned, the consumer stops after this long without
/// a new line.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
/// Hard stop for draining, for writers that never go quiet.
const DRAIN_LIMIT: Duration = Duration::from_secs(30);
const TICK: Duration = Duration::from_millis(25);

/// Run `producer` with the sending half of a bounded log channel while a
/// scoped consumer forwards every line to `sink`.
pub(crate) fn collect<T>(
    sink: &mut dyn LogSink,
    producer: impl FnOnce(SyncSender<LogLine>) -> T,
) -> (T, LogLines) {
    let (tx, rx) = sync_channel(CHANNEL_CAPACITY);
    let finished = AtomicBool::new(false);
    thread::scope(|scope| {
        let consumer = scope.spawn(|| consume(rx, sink, &finished));
        let outcome = producer(tx);
        finished.store(true, Ordering::SeqCst);
        let retained = consumer.join().unwrap_or_default();
        (outcome, LogLines::new(retained))
    })
}

fn consume(rx: Receiver<LogLine>, sink: &mut dyn LogSink, finished: &AtomicBool) -> VecDeque<LogLine> {
    let mut retained = VecDeque::new();
    let mut drain_started: Option<Instant> = None;
    let mut last_line = Instant::now();
    loop {
        match rx.recv_timeout(TICK) {
            Ok(line) => {
                sink.line(&line);
                if retained.len() == RETAINED_LINES {
                    retained.pop_front();
                }
                retained.push_back(line);
                last_line = Instant::now();
            }
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if finished.load(Ordering::SeqCst) {
            let started = *drain_started.get_or_insert_with(Instant::now);
            let idle = last_line.max(started).elapsed();
            if idle >= DRAIN_GRACE || started.elapsed() >= DRAIN_LIMIT {
                break;
            }
        }
    }
    retained
}

/// Forward `reader` line by line on a detached thread. The thread ends at EOF
/// or once the consumer has gone away.
pub(crate) fn spawn_reader<R>(reader: R, stream: LogStream, tx: SyncSender<LogLine>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(LogLine::now(stream, line)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}
