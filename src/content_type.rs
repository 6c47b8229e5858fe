//! Content-type detection for rendered payloads
//!
//! Precedence: binary signature sniffing over the leading bytes (with an SVG
//! heuristic, since SVG is XML and has no magic number), then the filename
//! extension table, then a caller-supplied default. Resolution never fails.

/// Default for raw and unknown content
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Default for rendered pages
pub const HTML_UTF8: &str = "text/html; charset=utf-8";

/// Number of leading bytes inspected by the text heuristics
const SNIFF_LEN: usize = 512;

/// Resolve a MIME type for `bytes`, optionally named `filename`
pub fn resolve(bytes: &[u8], filename: Option<&str>, default: &str) -> String {
    if let Some(mime) = sniff(bytes) {
        return mime.to_string();
    }
    if let Some(mime) = filename.and_then(from_extension) {
        return mime.to_string();
    }
    default.to_string()
}

/// Identify content by its signature
pub fn sniff(bytes: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
        (b"BZh", "application/x-bzip2"),
        (b"\xfd7zXZ\x00", "application/x-xz"),
        (b"\x00asm", "application/wasm"),
        (b"\x1a\x45\xdf\xa3", "video/webm"),
        (b"OggS", "audio/ogg"),
        (b"ID3", "audio/mpeg"),
        (b"fLaC", "audio/flac"),
        (b"wOFF", "font/woff"),
        (b"wOF2", "font/woff2"),
        (b"\x00\x00\x01\x00", "image/x-icon"),
    ];

    for (magic, mime) in SIGNATURES {
        if bytes.starts_with(magic) {
            return Some(*mime);
        }
    }

    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" {
        match &bytes[8..12] {
            b"WEBP" => return Some("image/webp"),
            b"WAVE" => return Some("audio/wav"),
            b"AVI " => return Some("video/x-msvideo"),
            _ => {}
        }
    }

    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return match &bytes[8..12] {
            b"avif" => Some("image/avif"),
            b"qt  " => Some("video/quicktime"),
            b"M4A " => Some("audio/mp4"),
            _ => Some("video/mp4"),
        };
    }

    if bytes.len() > 262 && &bytes[257..262] == b"ustar" {
        return Some("application/x-tar");
    }

    sniff_markup(bytes)
}

fn sniff_markup(bytes: &[u8]) -> Option<&'static str> {
    let head = &bytes[..bytes.len().min(SNIFF_LEN)];
    let text = String::from_utf8_lossy(head);
    let trimmed = text
        .trim_start_matches('\u{feff}')
        .trim_start()
        .to_ascii_lowercase();

    if is_svg(&trimmed) {
        return Some("image/svg+xml");
    }
    if trimmed.starts_with("<!doctype html") || trimmed.starts_with("<html") {
        return Some(HTML_UTF8);
    }
    if trimmed.starts_with("<?xml") {
        return Some("application/xml");
    }
    None
}

/// SVG heuristic: an `<svg` root, possibly behind an XML declaration,
/// comments or a doctype
fn is_svg(lowercase_head: &str) -> bool {
    if lowercase_head.starts_with("<svg") {
        return true;
    }
    let is_prologue = lowercase_head.starts_with("<?xml")
        || lowercase_head.starts_with("<!--")
        || lowercase_head.starts_with("<!doctype svg");
    is_prologue && lowercase_head.contains("<svg")
}

/// Look up a MIME type by the filename's extension
pub fn from_extension(filename: &str) -> Option<&'static str> {
    let (_, extension) = filename.rsplit_once('.')?;
    let mime = match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => HTML_UTF8,
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" | "text" => "text/plain; charset=utf-8",
        "md" | "markdown" => "text/markdown; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "car" => "application/vnd.ipld.car",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        _ => return None,
    };
    Some(mime)
}

/// MIME essence (type/subtype, lowercase, without parameters)
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
