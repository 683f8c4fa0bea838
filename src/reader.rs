//! Reader access layer.
//!
//! The worker only needs three things from a reader stack: enumerate,
//! connect to one reader, and push APDUs through the connection. The PC/SC
//! backend establishes a fresh context on every enumeration so a reader
//! plugged in (or a daemon restarted) between taps is picked up.

use std::ffi::CString;
use std::fmt;

use crate::error::ScanError;
use crate::scan::ApduResponse;

/// Name of an enumerated reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderHandle {
    name: CString,
}

impl ReaderHandle {
    pub fn new(name: CString) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &CString {
        &self.name
    }
}

impl fmt::Display for ReaderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name.to_string_lossy())
    }
}

pub trait Transmit {
    /// Sends one command. A response too short to hold a status word is a
    /// transport error.
    fn transmit(&mut self, command: &[u8]) -> Result<ApduResponse, ScanError>;
}

pub trait CardConnection: Transmit {
    /// Runs `reads` with exclusive access to the card. Backends without a
    /// transaction concept just run it.
    fn with_transaction<T, F>(&mut self, reads: F) -> Result<T, ScanError>
    where
        F: FnOnce(&mut dyn Transmit) -> Result<T, ScanError>,
        Self: Sized,
    {
        reads(self)
    }
}

pub trait ReaderAccess {
    type Connection: CardConnection;

    fn list_readers(&mut self) -> Result<Vec<ReaderHandle>, ScanError>;

    fn connect(&mut self, reader: &ReaderHandle) -> Result<Self::Connection, ScanError>;
}

/// PC/SC backed reader access.
#[derive(Default)]
pub struct PcscAccess {
    context: Option<pcsc::Context>,
}

impl PcscAccess {
    pub fn new() -> Self {
        Self::default()
    }

    fn context(&mut self) -> Result<&pcsc::Context, ScanError> {
        let context = match self.context.take() {
            Some(context) => context,
            None => pcsc::Context::establish(pcsc::Scope::User)?,
        };
        Ok(&*self.context.insert(context))
    }
}

impl ReaderAccess for PcscAccess {
    type Connection = PcscConnection;

    fn list_readers(&mut self) -> Result<Vec<ReaderHandle>, ScanError> {
        self.context = None;
        let readers = match self.context()?.list_readers_owned() {
            Ok(readers) => readers,
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(readers.into_iter().map(ReaderHandle::new).collect())
    }

    fn connect(&mut self, reader: &ReaderHandle) -> Result<PcscConnection, ScanError> {
        let card = self
            .context()?
            .connect(reader.name(), pcsc::ShareMode::Shared, pcsc::Protocols::ANY)?;
        Ok(PcscConnection { card })
    }
}

/// Connection to the card on one reader; disconnects on drop.
pub struct PcscConnection {
    card: pcsc::Card,
}

impl Transmit for PcscConnection {
    fn transmit(&mut self, command: &[u8]) -> Result<ApduResponse, ScanError> {
        transmit_on(&self.card, command)
    }
}

impl CardConnection for PcscConnection {
    fn with_transaction<T, F>(&mut self, reads: F) -> Result<T, ScanError>
    where
        F: FnOnce(&mut dyn Transmit) -> Result<T, ScanError>,
    {
        // Ends with LeaveCard when dropped.
        let transaction = self.card.transaction()?;
        let mut held = HeldTransaction(&transaction);
        reads(&mut held)
    }
}

struct HeldTransaction<'a, 'card>(&'a pcsc::Transaction<'card>);

impl Transmit for HeldTransaction<'_, '_> {
    fn transmit(&mut self, command: &[u8]) -> Result<ApduResponse, ScanError> {
        transmit_on(self.0, command)
    }
}

fn transmit_on(card: &pcsc::Card, command: &[u8]) -> Result<ApduResponse, ScanError> {
    let mut buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
    let raw = card.transmit(command, &mut buffer)?;
    ApduResponse::from_raw(raw).ok_or_else(|| {
        ScanError::Transport(format!("response of {} bytes has no status word", raw.len()))
    })
}
