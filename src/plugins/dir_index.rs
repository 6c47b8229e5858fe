use super::fingerprint;
use crate::content_type::HTML_UTF8;
use crate::context::RequestContext;
use crate::pipeline::{Plugin, PluginResult};
use crate::unixfs::{self, DirEntry, UnixFsNode};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Write;
use std::sync::OnceLock;

const TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Index of {{path}}</title>
<style>body{font-family:sans-serif;margin:2em}td{padding:0.2em 1em}.cid{font-family:monospace;color:#666}</style>
</head>
<body>
<h1>Index of {{path}}</h1>
<p class="cid">{{cid}}</p>
<table>
{{rows}}</table>
</body>
</html>
"#;

/// ETag prefix for listings; changes whenever the template does
fn etag_prefix() -> &'static str {
    static PREFIX: OnceLock<String> = OnceLock::new();
    PREFIX.get_or_init(|| format!("DirIndex-{}_CID-", fingerprint(TEMPLATE.as_bytes())))
}

/// Generates an HTML listing for UnixFS directories without `index.html`
pub struct DirIndexHtmlPlugin;

#[async_trait]
impl Plugin for DirIndexHtmlPlugin {
    fn id(&self) -> &str {
        "dir-index-html"
    }

    fn can_handle(&self, ctx: &RequestContext) -> bool {
        ctx.needs_dir_index && ctx.req_format.is_none() && ctx.path_details.is_some()
    }

    async fn handle(&self, ctx: &mut RequestContext) -> PluginResult {
        let (cid, block) = match &ctx.path_details {
            Some(details) => (details.terminal.cid, details.terminal.block.clone()),
            None => return Ok(None),
        };
        let node = UnixFsNode::from_block(&cid, &block)?;
        let entries = unixfs::list_directory(ctx.fetcher(), &node).await?;

        let html = render(&ctx.parsed.requested_path, &cid.to_string(), &entries);

        ctx.cache_hints.generated = true;
        ctx.cache_hints.content_prefix = Some(etag_prefix().to_string());
        let response = ctx.respond_bytes(Bytes::from(html), HTML_UTF8)?;
        Ok(Some(response))
    }
}

fn render(path: &str, cid: &str, entries: &[DirEntry]) -> String {
    let base = path.trim_end_matches('/');
    let mut rows = String::new();

    if base.matches('/').count() > 2 {
        let parent = &base[..base.rfind('/').unwrap_or(base.len())];
        let _ = writeln!(
            rows,
            "<tr><td><a href=\"{}/\">..</a></td><td></td><td></td></tr>",
            escape(parent)
        );
    }

    for entry in entries {
        let href = format!("{}/{}", base, urlencoding::encode(&entry.name));
        let size = entry.size.map(|s| s.to_string()).unwrap_or_default();
        let _ = writeln!(
            rows,
            "<tr><td><a href=\"{}\">{}</a></td><td class=\"cid\">{}</td><td>{}</td></tr>",
            escape(&href),
            escape(&entry.name),
            entry.cid,
            size
        );
    }

    TEMPLATE
        .replace("{{path}}", &escape(path))
        .replace("{{cid}}", cid)
        .replace("{{rows}}", &rows)
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::codecs;
    use crate::store::cid_for;

    #[test]
    fn test_render_escapes_names() {
        let cid = cid_for(b"entry", codecs::RAW);
        let entries = vec![DirEntry {
            name: "<b>&.txt".to_string(),
            cid,
            size: Some(5),
        }];
        let html = render("/ipfs/bafy/docs", "bafy", &entries);
        assert!(html.contains("&lt;b&gt;&amp;.txt"));
        assert!(html.contains("href=\"/ipfs/bafy/docs/%3Cb%3E%26.txt\""));
        assert!(html.contains("href=\"/ipfs/bafy/\">..</a>"));
        assert!(html.contains("Index of /ipfs/bafy/docs"));
    }

    #[test]
    fn test_root_listing_has_no_parent_link() {
        let html = render("/ipfs/bafy/", "bafy", &[]);
        assert!(!html.contains(">..</a>"));
    }

    #[test]
    fn test_etag_prefix_shape() {
        assert!(etag_prefix().starts_with("DirIndex-"));
        assert!(etag_prefix().ends_with("_CID-"));
    }
}
