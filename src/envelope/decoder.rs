//! Incremental envelope decoder
//!
//! Bytes arrive in arbitrary chunks. The decoder accumulates the header
//! until its closing marker, parses it, and then streams exactly the
//! declared number of payload bytes into a file in the storage directory.
//! It never consumes past the end of the current envelope: once complete,
//! the caller takes the envelope and feeds the rest of the chunk again.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::marker::{ClosingMarker, HeaderBuffer};
use super::{Envelope, HEADER_CLOSING_MARKER, MAX_HEADER_SIZE};
use crate::error::{Error, Result};

/// Upper bound on name collisions tried before giving up
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Bytes still required to finish the current envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    /// Still inside the header; the payload length is not known yet
    HeaderPending,
    Bytes(u64),
}

/// Result of one `put_data` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub consumed: usize,
    pub remaining: Remaining,
}

impl Progress {
    fn idle() -> Self {
        Self {
            consumed: 0,
            remaining: Remaining::Bytes(0),
        }
    }

    /// Nothing consumed and nothing left to do
    pub fn is_idle(&self) -> bool {
        self.consumed == 0 && self.remaining == Remaining::Bytes(0)
    }
}

enum DecodeState {
    Header(HeaderBuffer),
    Payload {
        envelope: Envelope,
        file: File,
        path: PathBuf,
        left: u64,
    },
    Complete(Envelope),
    Failed,
}

/// Decodes a stream of back-to-back envelopes
pub struct EnvelopeDecoder {
    storage: PathBuf,
    max_header: usize,
    state: DecodeState,
    /// Bytes of the last chunk taken by a rejected but complete header
    resync: Option<usize>,
}

impl EnvelopeDecoder {
    /// Create a decoder writing payload files into `storage`
    pub fn new(storage: impl Into<PathBuf>) -> Self {
        Self::with_max_header(storage, MAX_HEADER_SIZE)
    }

    pub fn with_max_header(storage: impl Into<PathBuf>, max_header: usize) -> Self {
        Self {
            storage: storage.into(),
            max_header,
            state: DecodeState::Header(new_header_buffer(max_header)),
            resync: None,
        }
    }

    /// Feed a chunk of bytes
    ///
    /// Returns how much of `data` was consumed and how much is still needed
    /// for the current envelope. `Progress::is_idle` means the decoder has
    /// a complete envelope waiting to be taken, or has failed. An error is
    /// terminal for the current envelope; `reset` starts over.
    pub fn put_data(&mut self, data: &[u8]) -> Result<Progress> {
        let mut consumed = 0;

        if let DecodeState::Header(buf) = &mut self.state {
            let mut found = false;
            for &byte in data {
                consumed += 1;
                match buf.push(byte) {
                    Ok(true) => {
                        found = true;
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        self.state = DecodeState::Failed;
                        return Err(e);
                    }
                }
            }
            if !found {
                return Ok(Progress {
                    consumed,
                    remaining: Remaining::HeaderPending,
                });
            }

            let raw = buf.take();
            if let Err(e) = self.start_payload(&raw) {
                if matches!(e, Error::MalformedHeader(_)) {
                    self.resync = Some(consumed);
                }
                self.state = DecodeState::Failed;
                return Err(e);
            }
        }

        match &mut self.state {
            DecodeState::Payload { file, path, left, .. } => {
                let n = (*left).min((data.len() - consumed) as u64) as usize;
                if n > 0 {
                    if let Err(e) = file.write_all(&data[consumed..consumed + n]) {
                        let err = Error::payload(path.display(), e);
                        self.fail();
                        return Err(err);
                    }
                    consumed += n;
                    *left -= n as u64;
                }
                let left = *left;
                if left == 0 {
                    self.finish_payload()?;
                }
                Ok(Progress {
                    consumed,
                    remaining: Remaining::Bytes(left),
                })
            }
            DecodeState::Complete(_) if consumed > 0 => Ok(Progress {
                consumed,
                remaining: Remaining::Bytes(0),
            }),
            _ => Ok(Progress::idle()),
        }
    }

    /// Parse the header and set up the payload file
    fn start_payload(&mut self, raw: &[u8]) -> Result<()> {
        let envelope = Envelope::from_header(raw, true)?;
        let len = envelope.data_len();

        debug!(
            "Decoded header of envelope [{}] ({} header bytes, {} payload bytes)",
            envelope.id(),
            raw.len(),
            len
        );

        if len == 0 {
            self.state = DecodeState::Complete(envelope);
            return Ok(());
        }

        let name = envelope
            .payload()
            .map(|p| p.filename.clone())
            .unwrap_or_default();
        let (file, path) = create_payload_file(&self.storage, &name, &envelope.id_str())?;

        self.state = DecodeState::Payload {
            envelope,
            file,
            path,
            left: len,
        };
        Ok(())
    }

    fn finish_payload(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, DecodeState::Failed) {
            DecodeState::Payload {
                mut envelope,
                mut file,
                path,
                ..
            } => {
                if let Err(e) = file.flush() {
                    let _ = std::fs::remove_file(&path);
                    return Err(Error::payload(path.display(), e));
                }
                drop(file);
                debug!("Payload of envelope [{}] written to {}", envelope.id(), path.display());
                envelope.attach_payload_file(path);
                self.state = DecodeState::Complete(envelope);
                Ok(())
            }
            other => {
                self.state = other;
                Ok(())
            }
        }
    }

    /// Where the stream continues after a failed `put_data`
    ///
    /// When the last error rejected a header whose closing marker was
    /// found, this is the number of bytes of that chunk the header used;
    /// the next envelope starts right after them. `None` when the failure
    /// left the stream position unknown (oversize header, payload I/O).
    pub fn resync_offset(&self) -> Option<usize> {
        match self.state {
            DecodeState::Failed => self.resync,
            _ => None,
        }
    }

    /// Whether a complete envelope is waiting
    pub fn is_complete(&self) -> bool {
        matches!(self.state, DecodeState::Complete(_))
    }

    /// Whether the decoder is partway through an envelope
    pub fn is_pending(&self) -> bool {
        match &self.state {
            DecodeState::Header(buf) => !buf.is_empty(),
            DecodeState::Payload { .. } => true,
            _ => false,
        }
    }

    /// Take the complete envelope and get ready for the next one
    pub fn take_envelope(&mut self) -> Option<Envelope> {
        if !self.is_complete() {
            return None;
        }
        match std::mem::replace(
            &mut self.state,
            DecodeState::Header(new_header_buffer(self.max_header)),
        ) {
            DecodeState::Complete(envelope) => Some(envelope),
            _ => None,
        }
    }

    /// Drop any partial envelope and start over
    pub fn reset(&mut self) {
        self.fail();
        self.resync = None;
        self.state = DecodeState::Header(new_header_buffer(self.max_header));
    }

    /// Abandon the current envelope, removing a partial payload file
    fn fail(&mut self) {
        if let DecodeState::Payload { file, path, .. } =
            std::mem::replace(&mut self.state, DecodeState::Failed)
        {
            drop(file);
            remove_partial(&path);
        }
    }
}

impl Drop for EnvelopeDecoder {
    fn drop(&mut self) {
        self.fail();
    }
}

fn new_header_buffer(limit: usize) -> HeaderBuffer {
    HeaderBuffer::new(ClosingMarker::new(HEADER_CLOSING_MARKER), limit)
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed partial payload file {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial payload file {}: {}", path.display(), e),
    }
}

/// Create a new payload file that does not clobber an existing one
///
/// The declared name is reduced to its last component. Collisions are
/// resolved by prefixing a counter: `name`, `1-name`, `2-name`...
fn create_payload_file(storage: &Path, name: &str, id_hex: &str) -> Result<(File, PathBuf)> {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{}.dat", id_hex));

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 0 {
            storage.join(&base)
        } else {
            storage.join(format!("{}-{}", attempt, base))
        };

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => return Ok((file, candidate)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(Error::payload(candidate.display(), e)),
        }
    }

    Err(Error::PayloadIo(format!(
        "no free file name for {} in {}",
        base,
        storage.display()
    )))
}
