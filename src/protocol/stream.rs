//! Envelope framing over a byte stream
//!
//! Envelopes travel back to back with no extra framing: the header's
//! closing marker and its declared payload length delimit each one.
//! Instances frame onto a boxed `Stream`, never a concrete socket type.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::envelope::{Envelope, EnvelopeDecoder, EnvelopeRef, Reception, Retriever};
use crate::error::{Error, Result};

/// Size of the read and write buffers
const BUFFER_SIZE: usize = 8192;

/// A connected link carrying envelopes in both directions
pub trait Link: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Link for T {}

/// The connection a protocol instance reads and writes
pub type Stream = Box<dyn Link>;

/// Box an accepted or connected socket as a `Stream`
pub fn link<T: Link + 'static>(io: T) -> Stream {
    Box::new(io)
}

/// Write one envelope's wire form. Returns the number of bytes written.
///
/// `for_application` sends the header only, with the local payload path,
/// for an application on this host.
pub async fn send_envelope<W>(writer: &mut W, envelope: &EnvelopeRef, for_application: bool) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut retriever = if for_application {
        Retriever::for_application(envelope)
    } else {
        Retriever::new(envelope)
    };

    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = retriever.retrieve(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;

    trace!("Wrote envelope [{}] ({} bytes)", envelope.id(), total);
    Ok(total)
}

/// Pulls complete envelopes out of a byte stream
pub struct EnvelopeReader {
    decoder: EnvelopeDecoder,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    bytes_read: u64,
    /// First byte of the envelope being decoded
    started: Option<Instant>,
    envelope_bytes: u64,
}

impl EnvelopeReader {
    pub fn new(storage: impl Into<PathBuf>, max_header: usize) -> Self {
        Self {
            decoder: EnvelopeDecoder::with_max_header(storage, max_header),
            buf: vec![0u8; BUFFER_SIZE],
            start: 0,
            end: 0,
            bytes_read: 0,
            started: None,
            envelope_bytes: 0,
        }
    }

    /// Total bytes read from the stream so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read until the next envelope is complete
    ///
    /// The envelope comes back with a `Reception` holding its transfer
    /// time and wire size.
    ///
    /// Returns `Ok(None)` at end of stream. A rejected header costs only
    /// that envelope: reading resumes right after its closing marker. Other
    /// decode errors leave the stream position unknown and discard the rest
    /// of the buffered data. The reader can be used again afterwards.
    pub async fn next<R>(&mut self, reader: &mut R) -> Result<Option<Envelope>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            while self.start < self.end {
                let started = *self.started.get_or_insert_with(Instant::now);
                match self.decoder.put_data(&self.buf[self.start..self.end]) {
                    Ok(progress) => {
                        self.start += progress.consumed;
                        self.envelope_bytes += progress.consumed as u64;
                        if let Some(mut envelope) = self.decoder.take_envelope() {
                            envelope.set_reception(Reception::new(
                                started.elapsed(),
                                self.envelope_bytes,
                            ));
                            self.started = None;
                            self.envelope_bytes = 0;
                            return Ok(Some(envelope));
                        }
                        if progress.consumed == 0 {
                            break;
                        }
                    }
                    Err(e) => {
                        match self.decoder.resync_offset() {
                            Some(n) => self.start += n,
                            None => self.start = self.end,
                        }
                        self.decoder.reset();
                        self.started = None;
                        self.envelope_bytes = 0;
                        return Err(e);
                    }
                }
            }

            let n = reader.read(&mut self.buf).await?;
            if n == 0 {
                if self.decoder.is_pending() {
                    warn!("Stream ended in the middle of an envelope");
                    self.decoder.reset();
                }
                self.started = None;
                self.envelope_bytes = 0;
                return Ok(None);
            }
            self.bytes_read += n as u64;
            self.start = 0;
            self.end = n;
        }
    }
}

/// Whether an error only affects the envelope being decoded
pub fn is_envelope_error(err: &Error) -> bool {
    matches!(
        err,
        Error::MalformedHeader(_) | Error::PayloadIo(_) | Error::HashMismatch
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Attribute, DataState, MAX_HEADER_SIZE};

    #[tokio::test]
    async fn test_send_and_read_back_to_back() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let path = src.path().join("blob.bin");
        std::fs::write(&path, vec![7u8; 20_000]).unwrap();

        let mut with_payload = Envelope::from_file(&path, None).unwrap();
        with_payload.add_attribute(Attribute::new("kind", "blob"));
        let first = EnvelopeRef::new(with_payload);

        let mut header_only = Envelope::new();
        header_only.add_attribute(Attribute::new("kind", "note"));
        let second = EnvelopeRef::new(header_only);

        let (mut client, mut server) = tokio::io::duplex(1024);
        let writer = tokio::spawn({
            let first = first.clone();
            let second = second.clone();
            async move {
                send_envelope(&mut client, &first, false).await.unwrap();
                send_envelope(&mut client, &second, false).await.unwrap();
            }
        });

        let mut reader = EnvelopeReader::new(dst.path(), MAX_HEADER_SIZE);
        let mut a = reader.next(&mut server).await.unwrap().unwrap();
        let b = reader.next(&mut server).await.unwrap().unwrap();
        writer.await.unwrap();
        assert!(reader.next(&mut server).await.unwrap().is_none());

        assert_eq!(a.id(), first.id());
        assert_eq!(a.verify_data(), DataState::VerifiedOk);
        let header_len = first.lock().raw_header().len() as u64;
        assert_eq!(a.reception().unwrap().bytes, header_len + 20_000);
        assert_eq!(
            b.reception().unwrap().bytes,
            second.lock().raw_header().len() as u64
        );
        assert_eq!(b.id(), second.id());
        assert_eq!(b.data_state(), DataState::NoData);
    }

    #[tokio::test]
    async fn test_reader_recovers_after_bad_header() {
        let dst = tempfile::tempdir().unwrap();
        let mut good = Envelope::new();
        good.add_attribute(Attribute::new("ok", "yes"));
        let good = EnvelopeRef::new(good);

        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(b"<Haggle><Attr></Haggle>").await.unwrap();
        client.flush().await.unwrap();

        let mut reader = EnvelopeReader::new(dst.path(), MAX_HEADER_SIZE);
        let err = reader.next(&mut server).await.unwrap_err();
        assert!(is_envelope_error(&err));

        send_envelope(&mut client, &good, false).await.unwrap();
        drop(client);
        let e = reader.next(&mut server).await.unwrap().unwrap();
        assert_eq!(e.id(), good.id());
    }

    #[tokio::test]
    async fn test_bad_header_and_good_envelope_in_one_write() {
        let dst = tempfile::tempdir().unwrap();
        let mut good = Envelope::new();
        good.add_attribute(Attribute::new("ok", "yes"));
        let good = EnvelopeRef::new(good);

        let mut chunk = b"<Haggle><Attr></Haggle>".to_vec();
        chunk.extend_from_slice(&good.lock().raw_header());

        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&chunk).await.unwrap();
        drop(client);

        let mut reader = EnvelopeReader::new(dst.path(), MAX_HEADER_SIZE);
        let err = reader.next(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));

        let e = reader.next(&mut server).await.unwrap().unwrap();
        assert_eq!(e.id(), good.id());
        assert!(reader.next(&mut server).await.unwrap().is_none());
    }
}
