//! Content Envelopes
//!
//! An envelope is the unit moved between devices: a structured header
//! (attributes plus metadata) and an optional payload stored in a file.
//!
//! ```text
//! <?xml version="1.0"?>
//! <Haggle persistent="yes" create_time="1700000000.000042">
//!   <Attr name="tag" weight="2">news</Attr>
//!   <Data data_len="5120"><FileName>photo.jpg</FileName><FileHash>base64</FileHash></Data>
//!   <Signature signee="node-id">base64</Signature>
//! </Haggle>
//! <5120 raw payload bytes>
//! ```
//!
//! The id is a SHA-1 over the attributes, the create time and the payload
//! hash (or file name and length), so unrelated header metadata can be
//! added without changing what an envelope is.

mod attribute;
mod decoder;
mod marker;
mod metadata;
mod retriever;
mod time;

pub use attribute::{Attribute, AttributeSet, ANY_VALUE};
pub use decoder::{EnvelopeDecoder, Progress, Remaining};
pub use marker::{ClosingMarker, HeaderBuffer};
pub use metadata::Metadata;
pub use retriever::Retriever;
pub use time::Timestamp;

use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::{Mutex, MutexGuard};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::common::Interface;
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Length of an envelope id and of a payload hash (SHA-1)
pub const ID_LEN: usize = 20;

/// Default upper bound on header size
pub const MAX_HEADER_SIZE: usize = 65536;

/// Largest payload accepted from the wire
pub const MAX_DATA_LEN: u64 = 1 << 32;

/// Root element of the header document
pub const ROOT_ELEMENT: &str = "Haggle";

/// Closing marker that terminates a header on the wire
pub const HEADER_CLOSING_MARKER: &str = "</Haggle>";

const ATTR_ELEMENT: &str = "Attr";
const ATTR_NAME_PARAM: &str = "name";
const ATTR_WEIGHT_PARAM: &str = "weight";
const CREATE_TIME_PARAM: &str = "create_time";
const PERSISTENT_PARAM: &str = "persistent";
const DATA_ELEMENT: &str = "Data";
const DATA_LEN_PARAM: &str = "data_len";
const FILE_NAME_ELEMENT: &str = "FileName";
const FILE_PATH_ELEMENT: &str = "FilePath";
const FILE_HASH_ELEMENT: &str = "FileHash";
const SIGNATURE_ELEMENT: &str = "Signature";
const SIGNEE_PARAM: &str = "signee";

/// Read buffer for hashing payload files
const HASH_BUFFER_SIZE: usize = 4096;

// ============================================================================
// Identity and state types
// ============================================================================

/// 160-bit content id
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvelopeId([u8; ID_LEN]);

impl EnvelopeId {
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvelopeId({})", self.to_hex())
    }
}

/// Payload verification state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    Unknown,
    NoData,
    NotVerified,
    VerifiedOk,
    VerifiedBad,
}

impl DataState {
    /// Whether verification has reached a verdict
    pub fn is_decided(&self) -> bool {
        matches!(self, DataState::VerifiedOk | DataState::VerifiedBad)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    Missing,
    Unverified,
    Valid,
    Invalid,
}

/// Signer identity and raw signature bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub signer: String,
    pub bytes: Vec<u8>,
}

/// Externally stored payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Local file holding the bytes; unknown until a file is attached
    pub path: Option<PathBuf>,
    /// Name the payload travels under
    pub filename: String,
    pub len: u64,
    pub hash: Option<[u8; ID_LEN]>,
}

/// How an envelope arrived over a link
#[derive(Debug, Clone)]
pub struct Reception {
    /// When the last byte was decoded
    pub time: Timestamp,
    /// From the first to the last byte of the envelope
    pub transfer_time: Duration,
    /// Wire bytes, header and payload
    pub bytes: u64,
    pub local: Option<Interface>,
    pub remote: Option<Interface>,
}

impl Reception {
    pub fn new(transfer_time: Duration, bytes: u64) -> Self {
        Self {
            time: Timestamp::now(),
            transfer_time,
            bytes,
            local: None,
            remote: None,
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A content-addressed data object
pub struct Envelope {
    id: EnvelopeId,
    attributes: AttributeSet,
    create_time: Option<Timestamp>,
    payload: Option<Payload>,
    persistent: bool,
    signature: Option<Signature>,
    data_state: DataState,
    signature_status: SignatureStatus,
    for_local_app: bool,
    reception: Option<Reception>,
    /// Header tree; holds any extra metadata piggy-backed by other components
    metadata: Metadata,
}

impl Envelope {
    /// Create an empty envelope stamped with the current time
    pub fn new() -> Self {
        let mut envelope = Self::blank();
        envelope.data_state = DataState::NoData;
        envelope.create_time = Some(Timestamp::now());
        envelope.calc_id();
        envelope
    }

    fn blank() -> Self {
        Self {
            id: EnvelopeId([0u8; ID_LEN]),
            attributes: AttributeSet::new(),
            create_time: None,
            payload: None,
            persistent: true,
            signature: None,
            data_state: DataState::Unknown,
            signature_status: SignatureStatus::Missing,
            for_local_app: false,
            reception: None,
            metadata: Metadata::new(ROOT_ELEMENT),
        }
    }

    /// Create an envelope whose payload is an existing file
    ///
    /// The file is hashed while its length is measured, so the payload
    /// starts out verified. `filename` defaults to the path's last component.
    pub fn from_file(path: impl AsRef<Path>, filename: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let filename = match filename {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::PayloadIo(format!("invalid file path {}", path.display())))?,
        };

        let (hash, len) = hash_file(path)?;

        let mut envelope = Self::blank();
        envelope.payload = Some(Payload {
            path: Some(path.to_path_buf()),
            filename,
            len,
            hash: Some(hash),
        });
        envelope.data_state = DataState::VerifiedOk;
        envelope.create_time = Some(Timestamp::now());
        envelope.calc_id();
        Ok(envelope)
    }

    /// Create an envelope from a complete raw header, e.g. one handed over
    /// by a local application. A `FilePath` element is honored here.
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        Self::from_header(raw, false)
    }

    /// Build from a received header. Locally meaningful elements
    /// (`FilePath`) are ignored when `from_network` is set.
    pub(crate) fn from_header(raw: &[u8], from_network: bool) -> Result<Self> {
        let metadata = Metadata::from_raw(raw)?;
        let mut envelope = Self::blank();
        envelope.parse_metadata(metadata, from_network)?;
        Ok(envelope)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    pub fn id_str(&self) -> String {
        self.id.to_hex()
    }

    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    pub fn create_time(&self) -> Option<Timestamp> {
        self.create_time
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Declared payload length (0 without payload)
    pub fn data_len(&self) -> u64 {
        self.payload.as_ref().map(|p| p.len).unwrap_or(0)
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.payload.as_ref().and_then(|p| p.path.as_deref())
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn data_state(&self) -> DataState {
        self.data_state
    }

    pub fn signature_status(&self) -> SignatureStatus {
        self.signature_status
    }

    pub fn is_for_local_app(&self) -> bool {
        self.for_local_app
    }

    /// Set only on envelopes decoded from a link
    pub fn reception(&self) -> Option<&Reception> {
        self.reception.as_ref()
    }

    /// Extra header metadata (read-only view of the last synced tree)
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Whether the payload carries a hash it can be checked against
    pub fn data_is_verifiable(&self) -> bool {
        self.payload
            .as_ref()
            .map(|p| p.len > 0 && p.hash.is_some())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------------
    // Mutators (each identity-relevant change recomputes the id)
    // ------------------------------------------------------------------------

    /// Add an attribute; returns false if (name, value) is already present
    pub fn add_attribute(&mut self, attr: Attribute) -> bool {
        let added = self.attributes.add(attr);
        if added {
            self.calc_id();
        }
        added
    }

    /// Remove by (name, value), or every value of `name` with `ANY_VALUE`
    pub fn remove_attribute(&mut self, name: &str, value: &str) -> usize {
        let removed = self.attributes.remove(name, value);
        if removed > 0 {
            self.calc_id();
        }
        removed
    }

    pub fn set_create_time(&mut self, time: Option<Timestamp>) {
        self.create_time = time;
        self.calc_id();
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    pub fn set_signature(&mut self, signer: impl Into<String>, bytes: Vec<u8>) {
        self.signature = Some(Signature {
            signer: signer.into(),
            bytes,
        });
        self.signature_status = SignatureStatus::Unverified;
    }

    /// Record the outcome of a signature check made by the security layer
    pub fn set_signature_status(&mut self, status: SignatureStatus) {
        self.signature_status = status;
    }

    /// Mark as addressed to a local application: the header then carries
    /// the local file path and retrieval sends the header only.
    pub fn set_for_local_app(&mut self, val: bool) {
        self.for_local_app = val;
    }

    /// Add a piggy-backed metadata element. It travels in the header but
    /// does not affect the id.
    ///
    /// An element named like the root, at any depth, would put the closing
    /// marker inside the header and is rejected.
    pub fn add_metadata(&mut self, element: Metadata) -> Result<()> {
        if contains_root_name(&element) {
            return Err(Error::MalformedHeader(format!(
                "metadata may not contain a <{}> element",
                ROOT_ELEMENT
            )));
        }
        self.metadata.add_child(element);
        Ok(())
    }

    /// Record transfer statistics for a received envelope. Not part of
    /// the header or the id.
    pub fn set_reception(&mut self, reception: Reception) {
        self.reception = Some(reception);
    }

    /// Record the interfaces an envelope was received on and from
    pub fn set_receive_interfaces(&mut self, local: Interface, remote: Interface) {
        let reception = self
            .reception
            .get_or_insert_with(|| Reception::new(Duration::ZERO, 0));
        reception.local = Some(local);
        reception.remote = Some(remote);
    }

    pub(crate) fn attach_payload_file(&mut self, path: PathBuf) {
        if let Some(payload) = self.payload.as_mut() {
            payload.path = Some(path);
        }
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    /// Recompute the id from attributes, create time and payload identity
    pub fn calc_id(&mut self) {
        let mut hasher = Sha1::new();

        for attr in self.attributes.iter() {
            hasher.update(attr.name().as_bytes());
            hasher.update(attr.value().as_bytes());
            hasher.update(attr.weight().to_be_bytes());
        }

        if let Some(time) = &self.create_time {
            hasher.update(time.to_string().as_bytes());
        }

        if let Some(payload) = &self.payload {
            match payload.hash {
                Some(hash) if payload.len > 0 => hasher.update(hash),
                _ if !payload.filename.is_empty() && payload.len > 0 => {
                    hasher.update(payload.filename.as_bytes());
                    hasher.update(payload.len.to_be_bytes());
                }
                _ => {}
            }
        }

        self.id = EnvelopeId(hasher.finalize().into());
    }

    // ------------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------------

    /// Hash the payload file and compare with the declared hash
    ///
    /// No-op when there is nothing verifiable or a verdict already exists.
    /// The payload file is only read.
    pub fn verify_data(&mut self) -> DataState {
        if self.data_state.is_decided() || !self.data_is_verifiable() {
            return self.data_state;
        }
        let Some(payload) = self.payload.as_ref() else {
            return self.data_state;
        };

        self.data_state = DataState::VerifiedBad;

        let Some(path) = payload.path.as_deref() else {
            warn!("Envelope [{}] has no payload file to verify", self.id);
            return self.data_state;
        };

        match hash_file(path) {
            Ok((digest, _)) if Some(digest) == payload.hash => {
                self.data_state = DataState::VerifiedOk;
            }
            Ok(_) => {
                warn!("Envelope [{}] payload hash mismatch", self.id);
            }
            Err(e) => {
                warn!("Envelope [{}] verification failed: {}", self.id, e);
            }
        }
        self.data_state
    }

    /// Verify and turn a bad verdict into `HashMismatch`
    pub fn check_data(&mut self) -> Result<()> {
        match self.verify_data() {
            DataState::VerifiedBad => Err(Error::HashMismatch),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Header conversion
    // ------------------------------------------------------------------------

    /// Sync state into the header tree and return it
    pub fn to_metadata(&self) -> Metadata {
        self.to_metadata_for(self.for_local_app)
    }

    /// Header tree, including the local file path when `for_application`
    pub fn to_metadata_for(&self, for_application: bool) -> Metadata {
        let mut md = self.metadata.clone();

        md.set_parameter(PERSISTENT_PARAM, if self.persistent { "yes" } else { "no" });
        match &self.create_time {
            Some(time) => md.set_parameter(CREATE_TIME_PARAM, time.to_string()),
            None => {
                md.remove_parameter(CREATE_TIME_PARAM);
            }
        }

        md.remove_children(DATA_ELEMENT);
        if let Some(payload) = self.payload.as_ref().filter(|p| p.len > 0) {
            let data = md.add_child(Metadata::new(DATA_ELEMENT));
            data.set_parameter(DATA_LEN_PARAM, payload.len.to_string());

            if for_application {
                if let Some(path) = &payload.path {
                    data.add_child(
                        Metadata::new(FILE_PATH_ELEMENT).with_content(path.to_string_lossy()),
                    );
                }
            }
            if !payload.filename.is_empty() {
                data.add_child(Metadata::new(FILE_NAME_ELEMENT).with_content(&payload.filename));
            }
            if let Some(hash) = &payload.hash {
                data.add_child(Metadata::new(FILE_HASH_ELEMENT).with_content(BASE64.encode(hash)));
            }
        }

        md.remove_children(SIGNATURE_ELEMENT);
        if let Some(sig) = self.signature.as_ref().filter(|s| !s.bytes.is_empty()) {
            md.add_child(Metadata::new(SIGNATURE_ELEMENT).with_content(BASE64.encode(&sig.bytes)))
                .set_parameter(SIGNEE_PARAM, sig.signer.clone());
        }

        md.remove_children(ATTR_ELEMENT);
        for attr in self.attributes.iter() {
            let element = md.add_child(Metadata::new(ATTR_ELEMENT).with_content(attr.value()));
            element.set_parameter(ATTR_NAME_PARAM, attr.name());
            if attr.weight() != 1 {
                element.set_parameter(ATTR_WEIGHT_PARAM, attr.weight().to_string());
            }
        }

        md
    }

    /// Header bytes as they go onto the wire, ending at the closing marker
    pub fn raw_header(&self) -> Vec<u8> {
        self.raw_header_for(self.for_local_app)
    }

    pub(crate) fn raw_header_for(&self, for_application: bool) -> Vec<u8> {
        let mut raw = self.to_metadata_for(for_application).to_raw();
        while raw.last().map_or(false, |b| *b != b'>') {
            raw.pop();
        }
        raw
    }

    fn parse_metadata(&mut self, mut md: Metadata, from_network: bool) -> Result<()> {
        if !md.name().eq_ignore_ascii_case(ROOT_ELEMENT) {
            return Err(Error::MalformedHeader(format!(
                "unrecognized root element <{}>",
                md.name()
            )));
        }

        if let Some(val) = md.parameter(PERSISTENT_PARAM) {
            match val {
                "no" | "false" => self.persistent = false,
                "yes" | "true" => self.persistent = true,
                _ => {}
            }
        }

        if let Some(val) = md.parameter(CREATE_TIME_PARAM) {
            self.create_time = Some(val.parse()?);
        }

        if let Some(sm) = md.child(SIGNATURE_ELEMENT) {
            let bytes = BASE64
                .decode(sm.content().trim())
                .map_err(|e| Error::MalformedHeader(format!("bad signature encoding: {}", e)))?;
            self.signature = Some(Signature {
                signer: sm.parameter(SIGNEE_PARAM).unwrap_or_default().to_string(),
                bytes,
            });
            self.signature_status = SignatureStatus::Unverified;
        }

        if let Some(dm) = md.child_mut(DATA_ELEMENT) {
            self.parse_data(dm, from_network)?;
        }
        if self.payload.is_none() {
            self.data_state = DataState::NoData;
        }

        for element in md.children_named(ATTR_ELEMENT) {
            let name = element.parameter(ATTR_NAME_PARAM).ok_or_else(|| {
                Error::MalformedHeader("attribute without a name".into())
            })?;
            let weight = match element.parameter(ATTR_WEIGHT_PARAM) {
                Some(w) => w
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| Error::MalformedHeader(format!("bad attribute weight '{}'", w)))?,
                None => 1,
            };
            self.attributes
                .add(Attribute::with_weight(name, element.content(), weight));
        }

        self.metadata = md;
        self.calc_id();
        Ok(())
    }

    fn parse_data(&mut self, dm: &mut Metadata, from_network: bool) -> Result<()> {
        let mut payload = Payload::default();

        if let Some(val) = dm.parameter(DATA_LEN_PARAM) {
            payload.len = val
                .trim()
                .parse()
                .map_err(|_| Error::MalformedHeader(format!("bad data length '{}'", val)))?;
            if payload.len > MAX_DATA_LEN {
                return Err(Error::MalformedHeader(format!(
                    "data length {} exceeds maximum {}",
                    payload.len, MAX_DATA_LEN
                )));
            }
        }

        if let Some(m) = dm.child(FILE_NAME_ELEMENT) {
            payload.filename = m.content().to_string();
        }

        // A file path is only meaningful on this host
        if let Some(m) = dm.child(FILE_PATH_ELEMENT) {
            if from_network {
                warn!("Ignoring file path in header received from the network");
            } else {
                let path = PathBuf::from(m.content());
                debug!("Envelope has file path: {}", path.display());
                if payload.len == 0 {
                    payload.len = std::fs::metadata(&path)
                        .map_err(|e| Error::payload(path.display(), e))?
                        .len();
                }
                if payload.filename.is_empty() {
                    payload.filename = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                }
                payload.path = Some(path);
            }
            dm.remove_children(FILE_PATH_ELEMENT);
        }

        if let Some(m) = dm.child(FILE_HASH_ELEMENT) {
            let decoded = BASE64
                .decode(m.content().trim())
                .map_err(|e| Error::MalformedHeader(format!("bad file hash encoding: {}", e)))?;
            let hash: [u8; ID_LEN] = decoded.try_into().map_err(|_| {
                Error::MalformedHeader("file hash has the wrong length".into())
            })?;
            payload.hash = Some(hash);
            if self.data_state == DataState::Unknown {
                self.data_state = DataState::NotVerified;
            }
        }

        self.payload = Some(payload);
        Ok(())
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Envelope {}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id)
            .field("attributes", &self.attributes.len())
            .field("data_len", &self.data_len())
            .field("persistent", &self.persistent)
            .field("data_state", &self.data_state)
            .finish()
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        if self.persistent {
            return;
        }
        if let Some(path) = self.file_path() {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Deleted payload file {} of envelope [{}]", path.display(), self.id),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Could not delete payload file {}: {}", path.display(), e),
            }
        }
    }
}

fn contains_root_name(element: &Metadata) -> bool {
    element.name().eq_ignore_ascii_case(ROOT_ELEMENT)
        || element.children().iter().any(contains_root_name)
}

/// SHA-1 and length of a file
fn hash_file(path: &Path) -> Result<([u8; ID_LEN], u64)> {
    let mut file = File::open(path).map_err(|e| Error::payload(path.display(), e))?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; HASH_BUFFER_SIZE];
    let mut len = 0u64;

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::payload(path.display(), e)),
        };
        hasher.update(&buf[..n]);
        len += n as u64;
    }

    Ok((hasher.finalize().into(), len))
}

// ============================================================================
// Shared handle
// ============================================================================

/// Shared, lockable envelope handle
///
/// The last clone to go away drops the envelope, which removes the payload
/// file of a non-persistent envelope. Copy what you need out of a guard
/// before calling into a store or the registry.
#[derive(Clone)]
pub struct EnvelopeRef(Arc<Mutex<Envelope>>);

impl EnvelopeRef {
    pub fn new(envelope: Envelope) -> Self {
        Self(Arc::new(Mutex::new(envelope)))
    }

    pub fn lock(&self) -> MutexGuard<'_, Envelope> {
        self.0.lock()
    }

    pub fn id(&self) -> EnvelopeId {
        self.0.lock().id()
    }

    /// Start streaming this envelope's wire form
    pub fn retriever(&self) -> Retriever {
        Retriever::new(self)
    }

    /// Whether both handles refer to the same envelope
    pub fn ptr_eq(&self, other: &EnvelopeRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Envelope> for EnvelopeRef {
    fn from(envelope: Envelope) -> Self {
        Self::new(envelope)
    }
}

impl fmt::Debug for EnvelopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvelopeRef({})", self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> Envelope {
        let mut e = Envelope::new();
        e.set_create_time(Some(Timestamp::new(1_700_000_000, 42)));
        e.add_attribute(Attribute::with_weight("tag", "news", 2));
        e.add_attribute(Attribute::new("kind", "text"));
        e
    }

    fn write_temp(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn test_id_is_deterministic() {
        let a = sample();
        let b = sample();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id_str().len(), 2 * ID_LEN);
        assert_eq!(a.id_str(), a.id_str().to_lowercase());
    }

    #[test]
    fn test_id_changes_with_each_input() {
        let base = sample();

        let mut attr = sample();
        attr.add_attribute(Attribute::new("tag", "sports"));
        assert_ne!(attr.id(), base.id());

        let mut weight = sample();
        weight.remove_attribute("tag", "news");
        weight.add_attribute(Attribute::with_weight("tag", "news", 3));
        assert_ne!(weight.id(), base.id());

        let mut time = sample();
        time.set_create_time(Some(Timestamp::new(1_700_000_000, 43)));
        assert_ne!(time.id(), base.id());

        let mut no_time = sample();
        no_time.set_create_time(None);
        assert_ne!(no_time.id(), base.id());
    }

    #[test]
    fn test_id_covers_payload_hash() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = write_temp(dir.path(), "a.bin", b"first payload");
        let p2 = write_temp(dir.path(), "b.bin", b"other payload");

        let mut e1 = Envelope::from_file(&p1, Some("x")).unwrap();
        let mut e2 = Envelope::from_file(&p2, Some("x")).unwrap();
        e1.set_create_time(None);
        e2.set_create_time(None);
        assert_ne!(e1.id(), e2.id());
        assert_eq!(e1.data_state(), DataState::VerifiedOk);
        assert_eq!(e1.data_len(), 13);
    }

    #[test]
    fn test_persistent_flag_not_in_id() {
        let mut e = sample();
        let id = e.id();
        e.set_persistent(false);
        assert_eq!(e.id(), id);
    }

    #[test]
    fn test_header_round_trip() {
        let mut e = sample();
        e.set_signature("node-1", vec![1, 2, 3, 4]);
        e.add_metadata(Metadata::new("Node").with_content("piggy")).unwrap();

        let raw = e.raw_header();
        assert!(raw.ends_with(HEADER_CLOSING_MARKER.as_bytes()));

        let parsed = Envelope::from_raw(&raw).unwrap();
        assert_eq!(parsed.id(), e.id());
        assert_eq!(parsed.attributes(), e.attributes());
        assert_eq!(parsed.create_time(), e.create_time());
        assert_eq!(parsed.signature(), e.signature());
        assert_eq!(parsed.signature_status(), SignatureStatus::Unverified);
        assert_eq!(parsed.data_state(), DataState::NoData);
        assert!(parsed.metadata().child("Node").is_some());
    }

    #[test]
    fn test_header_round_trip_keeps_value_whitespace() {
        let mut e = sample();
        e.add_attribute(Attribute::new("note", "  "));
        e.add_attribute(Attribute::new("title", "  leading and trailing "));

        let parsed = Envelope::from_raw(&e.raw_header()).unwrap();
        assert_eq!(parsed.id(), e.id());
        assert_eq!(parsed.attributes(), e.attributes());
    }

    #[test]
    fn test_metadata_named_like_root_rejected() {
        let mut e = sample();
        assert!(matches!(
            e.add_metadata(Metadata::new("haggle")),
            Err(Error::MalformedHeader(_))
        ));

        let mut nested = Metadata::new("Node");
        nested.add_child(Metadata::new(ROOT_ELEMENT));
        assert!(e.add_metadata(nested).is_err());
        assert!(e.metadata().child("Node").is_none());

        let raw = e.raw_header();
        let text = String::from_utf8(raw).unwrap();
        assert_eq!(text.matches(HEADER_CLOSING_MARKER).count(), 1);
    }

    #[test]
    fn test_reception_not_in_header_or_id() {
        use crate::common::InterfaceType;

        let mut e = sample();
        let id = e.id();
        let header = e.raw_header();
        assert!(e.reception().is_none());

        e.set_reception(Reception::new(Duration::from_millis(12), 300));
        e.set_receive_interfaces(
            Interface::new("eth0", InterfaceType::WiredLan),
            Interface::new("peer", InterfaceType::WiredLan),
        );

        let r = e.reception().unwrap();
        assert_eq!(r.transfer_time, Duration::from_millis(12));
        assert_eq!(r.bytes, 300);
        assert_eq!(r.local.as_ref().unwrap().id.as_str(), "eth0");
        assert_eq!(r.remote.as_ref().unwrap().id.as_str(), "peer");
        assert_eq!(e.id(), id);
        assert_eq!(e.raw_header(), header);
        assert!(Envelope::from_raw(&header).unwrap().reception().is_none());
    }

    #[test]
    fn test_parse_rejects_foreign_root() {
        let raw = b"<Other><Attr name=\"a\">b</Attr></Other>";
        assert!(matches!(Envelope::from_raw(raw), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_parse_rejects_nameless_attribute() {
        let raw = b"<Haggle><Attr>b</Attr></Haggle>";
        assert!(matches!(Envelope::from_raw(raw), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_network_header_ignores_file_path() {
        let raw = b"<Haggle><Data data_len=\"4\"><FilePath>/etc/passwd</FilePath></Data></Haggle>";
        let e = Envelope::from_header(raw, true).unwrap();
        assert!(e.file_path().is_none());
        assert_eq!(e.data_len(), 4);
        assert_eq!(e.payload().unwrap().filename, "");
    }

    #[test]
    fn test_local_file_path_honored() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(dir.path(), "doc.txt", b"hello");
        let raw = format!(
            "<Haggle><Data><FilePath>{}</FilePath></Data></Haggle>",
            path.display()
        );
        let e = Envelope::from_raw(raw.as_bytes()).unwrap();
        assert_eq!(e.file_path(), Some(path.as_path()));
        assert_eq!(e.data_len(), 5);
        assert_eq!(e.payload().unwrap().filename, "doc.txt");
    }

    #[test]
    fn test_verify_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(dir.path(), "p.bin", b"payload bytes");
        let source = Envelope::from_file(&path, None).unwrap();

        // A copy of the header with the payload attached but unverified
        let mut received = Envelope::from_header(&source.raw_header(), true).unwrap();
        received.attach_payload_file(path.clone());
        assert_eq!(received.data_state(), DataState::NotVerified);

        assert_eq!(received.verify_data(), DataState::VerifiedOk);
        std::fs::write(&path, b"tampered").unwrap();
        assert_eq!(received.verify_data(), DataState::VerifiedOk);
    }

    #[test]
    fn test_verify_detects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(dir.path(), "p.bin", b"payload bytes");
        let source = Envelope::from_file(&path, None).unwrap();

        let mut received = Envelope::from_header(&source.raw_header(), true).unwrap();
        let other = write_temp(dir.path(), "q.bin", b"something else");
        received.attach_payload_file(other);

        assert!(matches!(received.check_data(), Err(Error::HashMismatch)));
        assert_eq!(received.verify_data(), DataState::VerifiedBad);
        std::fs::write(&path, b"payload bytes").unwrap();
        assert_eq!(received.verify_data(), DataState::VerifiedBad);
    }

    #[test]
    fn test_non_persistent_drop_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(dir.path(), "gone.bin", b"bytes");

        let mut e = Envelope::from_file(&path, None).unwrap();
        e.set_persistent(false);
        let shared = EnvelopeRef::new(e);
        let clone = shared.clone();
        drop(shared);
        assert!(path.exists());
        drop(clone);
        assert!(!path.exists());
    }

    #[test]
    fn test_persistent_drop_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(dir.path(), "kept.bin", b"bytes");

        let e = Envelope::from_file(&path, None).unwrap();
        assert!(e.is_persistent());
        drop(e);
        assert!(path.exists());
    }
}
