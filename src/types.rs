//! Core types for the edit-history engine.

use crate::ops::Operation;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for an image.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageId(pub Uuid);

impl ImageId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        ImageId(Uuid::new_v4())
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageId({})", self.0)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ImageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ImageId(Uuid::parse_str(s)?))
    }
}

/// Identifier for a session.
///
/// Sessions may be created with a caller-chosen id, so this is a string
/// rather than a UUID.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in an image's history log. Sequence 0 is the original upload.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Sequence {
    pub const ORIGINAL: Sequence = Sequence(0);

    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }
}

/// Content hash (SHA-256).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Opaque reference to one stored revision.
///
/// Keys are derived from the owning image, a random nonce and the content,
/// so every write yields a fresh key even when the pixels repeat. Clients
/// can use the key directly as a cache-busting token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionKey(pub Hash);

impl RevisionKey {
    /// Derive a new, never-before-issued key for content owned by `image`.
    pub fn generate(image: ImageId, content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(image.0.as_bytes());
        hasher.update(Uuid::new_v4().as_bytes());
        hasher.update(content);
        RevisionKey(Hash(hasher.finalize().into()))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(RevisionKey(Hash::from_hex(s)?))
    }

    /// First byte of the key in hex (for directory sharding).
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0 .0[0..1])
    }
}

impl fmt::Debug for RevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rev({}...)", &self.to_hex()[..12])
    }
}

impl fmt::Display for RevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }

    pub fn plus(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(micros(duration)))
    }

    pub fn minus(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(micros(duration)))
    }
}

/// Whole microseconds in `duration`, saturating at `i64::MAX`.
fn micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Encoded image format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Bmp,
    Webp,
    Tiff,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 6] = [
        ImageFormat::Jpeg,
        ImageFormat::Png,
        ImageFormat::Gif,
        ImageFormat::Bmp,
        ImageFormat::Webp,
        ImageFormat::Tiff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Webp => "webp",
            ImageFormat::Tiff => "tiff",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Tiff => "image/tiff",
        }
    }

    /// Whether the format can carry an alpha channel.
    pub fn supports_alpha(&self) -> bool {
        !matches!(self, ImageFormat::Jpeg | ImageFormat::Bmp)
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            ImageFormat::Jpeg => 0,
            ImageFormat::Png => 1,
            ImageFormat::Gif => 2,
            ImageFormat::Bmp => 3,
            ImageFormat::Webp => 4,
            ImageFormat::Tiff => 5,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        ImageFormat::ALL.get(byte as usize).copied()
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "png" => Ok(ImageFormat::Png),
            "gif" => Ok(ImageFormat::Gif),
            "bmp" => Ok(ImageFormat::Bmp),
            "webp" => Ok(ImageFormat::Webp),
            "tiff" | "tif" => Ok(ImageFormat::Tiff),
            other => Err(format!("unknown image format: {other}")),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Width and height in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Dimensions with width and height exchanged.
    pub fn transposed(&self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }
}

/// Encoded image data handed to and returned from transform functions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pixels {
    pub data: Vec<u8>,
    pub format: ImageFormat,
    pub dimensions: Dimensions,
}

/// Kind of operation recorded in a history entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Resize,
    Rotate,
    Flip,
    Compress,
    RemoveBackground,
    AiEdit,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Resize => "resize",
            OperationKind::Rotate => "rotate",
            OperationKind::Flip => "flip",
            OperationKind::Compress => "compress",
            OperationKind::RemoveBackground => "remove_background",
            OperationKind::AiEdit => "ai_edit",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a revision is a full image or a derived thumbnail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionKind {
    Full,
    Thumbnail,
}

/// Metadata for one immutable stored artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub key: RevisionKey,
    pub kind: RevisionKind,
    pub content_hash: Hash,
    pub byte_size: u64,
    pub dimensions: Dimensions,
    pub format: ImageFormat,
    pub created: Timestamp,
}

/// What produced a history entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryAction {
    /// The upload itself (always sequence 0).
    Original { filename: String },
    /// An applied operation.
    Applied(Operation),
}

/// One logged step in an image's history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub image: ImageId,

    /// Contiguous position in the log, starting at 0.
    pub sequence: Sequence,

    /// The sequence that was current when this entry was appended.
    /// `None` only for the original.
    pub parent: Option<Sequence>,

    pub action: EntryAction,

    /// The stored result.
    pub revision: Revision,

    /// Thumbnail derived from `revision`.
    pub thumbnail: Revision,

    pub timestamp: Timestamp,
}

impl HistoryEntry {
    /// Operation kind, or `None` for the original upload.
    pub fn kind(&self) -> Option<OperationKind> {
        match &self.action {
            EntryAction::Original { .. } => None,
            EntryAction::Applied(op) => Some(op.kind()),
        }
    }

    /// Operation parameters rendered as JSON (for API layers).
    pub fn params_json(&self) -> serde_json::Value {
        match &self.action {
            EntryAction::Original { filename } => serde_json::json!({ "filename": filename }),
            EntryAction::Applied(op) => {
                serde_json::to_value(op).unwrap_or(serde_json::Value::Null)
            }
        }
    }
}

/// An image as presented to readers.
///
/// `current`, `thumbnail` and the declared size fields always describe the
/// same history entry; they are only ever replaced together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub session: SessionId,
    pub original_filename: String,
    pub original: RevisionKey,
    pub current: RevisionKey,
    pub thumbnail: RevisionKey,
    pub current_sequence: Sequence,
    pub dimensions: Dimensions,
    pub format: ImageFormat,
    pub byte_size: u64,
    pub created: Timestamp,
    pub modified: Timestamp,
}

/// Time-boxed ownership scope for a set of images.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created: Timestamp,
    pub expires: Timestamp,
    pub last_activity: Timestamp,
    pub image_limit: usize,
}

impl Session {
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Timestamp::now())
    }
}

/// Engine statistics.
#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    pub session_count: u64,
    pub image_count: u64,
    pub history_entry_count: u64,
    pub revision_count: u64,
    pub revision_bytes: u64,
    pub tracked_locks: u64,
}
