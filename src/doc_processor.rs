/// Image types accepted for upload and sent inline to vision-capable models.
pub const IMAGE_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

/// Document types accepted for upload; their text is extracted at upload time.
pub const DOCUMENT_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "text/plain",
    "text/markdown",
    "text/csv",
    "application/json",
];

const MAX_EXTRACTED_CHARS: usize = 200_000;

pub fn is_allowed_mime(mime: &str) -> bool {
    IMAGE_MIME_TYPES.contains(&mime) || DOCUMENT_MIME_TYPES.contains(&mime)
}

/// Resolves the effective MIME type of an upload. The declared type wins
/// unless it is missing or generic, in which case the extension decides.
pub fn normalize_mime(declared: Option<&str>, file_name: &str) -> String {
    let declared = declared
        .map(|m| m.split(';').next().unwrap_or("").trim().to_lowercase())
        .filter(|m| !m.is_empty() && m != "application/octet-stream");
    if let Some(mime) = declared {
        return mime;
    }

    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Parse a document into plain text. Images carry no text and yield `None`.
pub fn extract_text(bytes: &[u8], mime: &str) -> Result<Option<String>, String> {
    let content = match mime {
        "application/pdf" => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| format!("PDF parse error: {}", e))?,
        "text/plain" | "text/markdown" | "text/csv" | "application/json" => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        _ => return Ok(None),
    };

    let content = content.trim();
    if content.is_empty() {
        return Ok(None);
    }
    Ok(Some(content.chars().take(MAX_EXTRACTED_CHARS).collect()))
}
