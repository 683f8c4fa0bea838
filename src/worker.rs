//! The scan loop that runs inside the isolated worker process.
//!
//! `ScanWorker::run` never returns and has no cancellation point; the
//! supervisor bounds it from outside by killing the process.

use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crate::delivery::{Deliver, PlatformDelivery};
use crate::error::ScanError;
use crate::reader::{CardConnection, PcscAccess, ReaderAccess, Transmit};
use crate::scan::{read_command, Payload, PayloadFormat, ScanResult, READ_BLOCKS};
use crate::settings::Settings;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// What a single scan attempt ended with.
#[derive(Debug)]
pub enum ScanOutcome {
    NoReader,
    /// Connecting or reading failed; nothing was delivered.
    Skipped(ScanError),
    Empty,
    Delivered(Payload),
    /// Data was read but delivery failed, or the attempt panicked.
    Failed(ScanError),
}

pub struct ScanWorker<R, D> {
    reader: R,
    delivery: D,
    format: PayloadFormat,
    poll_interval: Duration,
    iteration: u64,
}

impl<R: ReaderAccess, D: Deliver> ScanWorker<R, D> {
    pub fn new(reader: R, delivery: D, format: PayloadFormat, poll_interval: Duration) -> Self {
        Self {
            reader,
            delivery,
            format,
            poll_interval,
            iteration: 0,
        }
    }

    /// Scans forever, one attempt per poll interval.
    pub fn run(&mut self) -> ! {
        log_info!(
            "scan worker started, polling every {}ms",
            self.poll_interval.as_millis()
        );
        loop {
            self.scan_once();
            std::thread::sleep(self.poll_interval);
        }
    }

    /// One attempt. Never panics and never returns an error; the outcome
    /// says what happened.
    pub fn scan_once(&mut self) -> ScanOutcome {
        self.iteration += 1;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.attempt())) {
            Ok(outcome) => outcome,
            Err(panic) => ScanOutcome::Failed(ScanError::Panicked(panic_message(&*panic))),
        };
        self.report(&outcome);
        outcome
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    fn attempt(&mut self) -> ScanOutcome {
        let readers = match self.reader.list_readers() {
            Ok(readers) => readers,
            Err(ScanError::ReaderUnavailable) => return ScanOutcome::NoReader,
            Err(err) => return ScanOutcome::Skipped(err),
        };
        let Some(reader) = readers.first() else {
            return ScanOutcome::NoReader;
        };

        let mut connection = match self.reader.connect(reader) {
            Ok(connection) => connection,
            Err(err) => return ScanOutcome::Skipped(err),
        };
        log_info!("card detected on {reader}, reading");

        let scan = match read_windows(&mut connection) {
            Ok(scan) => scan,
            Err(err) => return ScanOutcome::Skipped(err),
        };
        drop(connection);

        let Some(payload) = self.format.build(&scan) else {
            return ScanOutcome::Empty;
        };
        match self.delivery.deliver(&payload) {
            Ok(()) => ScanOutcome::Delivered(payload),
            Err(err) => ScanOutcome::Failed(err),
        }
    }

    fn report(&self, outcome: &ScanOutcome) {
        let n = self.iteration;
        match outcome {
            ScanOutcome::NoReader => log_warn!("no NFC reader found"),
            ScanOutcome::Skipped(err) if err.is_idle() => {
                log_debug!("scan #{n}: nothing to read ({err})")
            }
            ScanOutcome::Skipped(err) => log_warn!("scan #{n}: {err}, skipping scan"),
            ScanOutcome::Empty => log_warn!("scan #{n}: no valid data read, skipping"),
            ScanOutcome::Delivered(payload) => log_info!("scan #{n}: delivered {payload}"),
            ScanOutcome::Failed(err) => log_error!("scan #{n}: {err}"),
        }
    }
}

/// Reads every window of the tag. Rejected windows add nothing; a
/// transport failure abandons the whole read so a card pulled away
/// mid-read never yields a truncated URL.
pub fn read_windows<C: CardConnection>(connection: &mut C) -> Result<ScanResult, ScanError> {
    connection.with_transaction(|card| {
        let mut scan = ScanResult::new();
        for block in READ_BLOCKS {
            let response = card.transmit(&read_command(block))?;
            if !response.is_success() {
                log_debug!(
                    "block {block} rejected with status {:02X}{:02X}",
                    response.sw1,
                    response.sw2
                );
            }
            scan.push_window(&response);
        }
        Ok(scan)
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Exits this process once stdin reaches EOF.
///
/// The supervisor holds the write end of the worker's stdin, so EOF means
/// the supervisor is gone and this worker would otherwise be orphaned.
pub fn exit_when_parent_closes_stdin() {
    let spawned = std::thread::Builder::new()
        .name("parent-watch".into())
        .spawn(|| {
            wait_for_eof(io::stdin().lock());
            log_info!("supervisor pipe closed, worker exiting");
            std::process::exit(0);
        });
    if let Err(err) = spawned {
        log_warn!("failed to start parent watch thread: {err}");
    }
}

/// Blocks until `input` reaches EOF or fails, discarding anything read.
pub fn wait_for_eof<R: Read>(mut input: R) {
    if let Err(err) = io::copy(&mut input, &mut io::sink()) {
        log_debug!("parent pipe read failed: {err}");
    }
}

/// Entry point of the `worker` subcommand.
pub fn run_worker_process(settings: &Settings, watch_parent: bool) -> ! {
    if watch_parent {
        exit_when_parent_closes_stdin();
    }
    let format = PayloadFormat {
        scheme: settings.url_scheme.clone(),
        artifact_prefix: settings.artifact_prefix.clone(),
    };
    let mut worker = ScanWorker::new(
        PcscAccess::new(),
        PlatformDelivery::new(settings),
        format,
        settings.poll_interval(),
    );
    worker.run()
}
