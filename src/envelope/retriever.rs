//! Streaming envelope encoder
//!
//! Produces the wire form of an envelope: the header up to and including
//! its closing marker, then the payload read from the backing file.

use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::path::PathBuf;

use super::EnvelopeRef;
use crate::error::{Error, Result};

pub struct Retriever {
    header: Vec<u8>,
    pos: usize,
    path: Option<PathBuf>,
    file: Option<File>,
    payload_len: u64,
    left: u64,
}

impl Retriever {
    /// Snapshot the envelope's header and payload location
    ///
    /// The envelope lock is held only while the header is rendered.
    pub fn new(envelope: &EnvelopeRef) -> Self {
        let for_application = envelope.lock().is_for_local_app();
        Self::build(envelope, for_application)
    }

    /// Header-only retrieval for an application on this host. The header
    /// names the local payload file instead of carrying the bytes.
    pub fn for_application(envelope: &EnvelopeRef) -> Self {
        Self::build(envelope, true)
    }

    fn build(envelope: &EnvelopeRef, for_application: bool) -> Self {
        let guard = envelope.lock();
        let header = guard.raw_header_for(for_application);
        let (path, left) = if for_application {
            (None, 0)
        } else {
            (guard.file_path().map(|p| p.to_path_buf()), guard.data_len())
        };
        drop(guard);

        Self {
            header,
            pos: 0,
            path,
            file: None,
            payload_len: left,
            left,
        }
    }

    /// Header plus payload bytes
    pub fn total_len(&self) -> u64 {
        self.header.len() as u64 + self.payload_len
    }

    pub fn header_len(&self) -> usize {
        self.header.len()
    }

    /// Copy the next slice of the wire form into `buf`
    ///
    /// Returns 0 at end of data. An error is terminal for this retrieval.
    pub fn retrieve(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.pos < self.header.len() {
            let n = buf.len().min(self.header.len() - self.pos);
            buf[..n].copy_from_slice(&self.header[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }

        if self.left == 0 {
            return Ok(0);
        }

        let Some(path) = self.path.as_ref() else {
            return Err(Error::PayloadIo("envelope has no payload file".into()));
        };
        if self.file.is_none() {
            self.file = Some(File::open(path).map_err(|e| Error::payload(path.display(), e))?);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };

        let want = (buf.len() as u64).min(self.left) as usize;
        let n = loop {
            match file.read(&mut buf[..want]) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::payload(path.display(), e)),
            }
        };
        if n == 0 {
            return Err(Error::PayloadIo(format!(
                "{}: truncated with {} bytes left",
                path.display(),
                self.left
            )));
        }

        self.left -= n as u64;
        if self.left == 0 {
            self.file = None;
        }
        Ok(n)
    }
}

impl Read for Retriever {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.retrieve(buf)
            .map_err(|e| io::Error::new(ErrorKind::Other, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Attribute, Envelope, HEADER_CLOSING_MARKER};

    #[test]
    fn test_header_then_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.bin");
        std::fs::write(&path, b"payload!").unwrap();

        let mut e = Envelope::from_file(&path, None).unwrap();
        e.add_attribute(Attribute::new("a", "b"));
        let shared = EnvelopeRef::new(e);

        let mut r = shared.retriever();
        let header_len = r.header_len();
        assert_eq!(r.total_len(), header_len as u64 + 8);

        let mut out = Vec::new();
        let mut buf = [0u8; 5];
        loop {
            let n = r.retrieve(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }

        assert!(out[..header_len].ends_with(HEADER_CLOSING_MARKER.as_bytes()));
        assert_eq!(&out[header_len..], b"payload!");
        assert_eq!(r.retrieve(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_local_app_is_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.bin");
        std::fs::write(&path, b"payload!").unwrap();

        let mut e = Envelope::from_file(&path, None).unwrap();
        e.set_for_local_app(true);
        let shared = EnvelopeRef::new(e);

        let mut out = Vec::new();
        shared.retriever().read_to_end(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with(HEADER_CLOSING_MARKER));
        assert!(text.contains("<FilePath>"));
    }

    #[test]
    fn test_for_application_overrides_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.bin");
        std::fs::write(&path, b"payload!").unwrap();

        let shared = EnvelopeRef::new(Envelope::from_file(&path, None).unwrap());
        let r = Retriever::for_application(&shared);
        assert_eq!(r.total_len(), r.header_len() as u64);
        assert!(!shared.lock().is_for_local_app());
    }

    #[test]
    fn test_deleted_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.bin");
        std::fs::write(&path, b"payload!").unwrap();

        let shared = EnvelopeRef::new(Envelope::from_file(&path, None).unwrap());
        let mut r = shared.retriever();
        let mut buf = vec![0u8; r.header_len()];
        assert_eq!(r.retrieve(&mut buf).unwrap(), buf.len());

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(r.retrieve(&mut buf), Err(Error::PayloadIo(_))));
    }

    #[test]
    fn test_truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.bin");
        std::fs::write(&path, b"payload!").unwrap();

        let shared = EnvelopeRef::new(Envelope::from_file(&path, None).unwrap());
        std::fs::write(&path, b"pay").unwrap();

        let mut out = Vec::new();
        assert!(shared.retriever().read_to_end(&mut out).is_err());
    }
}
