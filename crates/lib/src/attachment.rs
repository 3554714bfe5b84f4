//! Pending image attachment: at most one payload, held until the turn that
//! uses it is submitted or the user removes it.
//!
//! The reader turns a bounded-size image file into a data URI. Attachment
//! failures never touch history or mode; the caller surfaces them as a
//! transient notice and the pending slot stays unset.

use base64::Engine;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("attachment is {size} bytes, over the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("unsupported attachment type: {0}")]
    UnsupportedType(String),
    #[error("failed to read attachment: {0}")]
    Read(#[from] std::io::Error),
}

/// An image payload ready to ride along with the next user turn.
#[derive(Debug, Clone)]
pub struct PendingAttachment {
    pub data_uri: String,
    pub filename: String,
}

/// Holds at most one pending attachment.
#[derive(Default)]
pub struct AttachmentStore {
    pending: Option<PendingAttachment>,
}

impl AttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an attachment for the next turn, replacing any previous one.
    pub fn set(&mut self, attachment: PendingAttachment) {
        self.pending = Some(attachment);
    }

    /// Capture and clear the pending attachment.
    pub fn take(&mut self) -> Option<PendingAttachment> {
        self.pending.take()
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }

    pub fn pending(&self) -> Option<&PendingAttachment> {
        self.pending.as_ref()
    }
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Read an image file into a data-URI attachment. Rejects files above
/// `max_bytes` (checked before reading) and non-image extensions.
pub async fn read_image(path: &Path, max_bytes: u64) -> Result<PendingAttachment, AttachmentError> {
    let content_type = content_type_for(path).ok_or_else(|| {
        AttachmentError::UnsupportedType(
            path.extension()
                .and_then(|e| e.to_str())
                .unwrap_or("(none)")
                .to_string(),
        )
    })?;

    let meta = tokio::fs::metadata(path).await?;
    if meta.len() > max_bytes {
        return Err(AttachmentError::TooLarge {
            size: meta.len(),
            limit: max_bytes,
        });
    }

    let bytes = tokio::fs::read(path).await?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "attachment".to_string());

    Ok(PendingAttachment {
        data_uri: format!("data:{};base64,{}", content_type, encoded),
        filename,
    })
}
