//! HTML-to-text rendering for replicated articles.
//!
//! Helpdesk articles arrive as HTML; the chat side wants plain text. The
//! cleanup removes non-content elements, flattens the DOM to text with
//! block-level line breaks, and optionally strips the quoted-reply chain
//! that mail clients append below a reply.

use kuchiki::traits::*;
use kuchiki::NodeRef;

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "li", "tr", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "pre",
];

/// Render an HTML fragment as plain text.
pub fn html_to_text(html: &str) -> String {
    let document = kuchiki::parse_html().one(html);
    remove_comments(&document);
    remove_by_selector(&document, "head, script, style, meta, link, title, noscript");
    let mut out = String::new();
    collect_text(&document, &mut out);
    collapse_blank_lines(&out)
}

fn remove_comments(document: &NodeRef) {
    let nodes: Vec<NodeRef> = document.descendants().collect();
    for node in nodes {
        if node.as_comment().is_some() {
            node.detach();
        }
    }
}

fn remove_by_selector(document: &NodeRef, selector: &str) {
    if let Ok(nodes) = document.select(selector) {
        let nodes: Vec<_> = nodes.collect();
        for node in nodes {
            node.as_node().detach();
        }
    }
}

fn collect_text(node: &NodeRef, out: &mut String) {
    for child in node.children() {
        if let Some(text) = child.as_text() {
            let text = text.borrow();
            let trimmed = text.replace(['\r', '\n'], " ");
            if !trimmed.trim().is_empty() {
                out.push_str(trimmed.trim_matches(|c: char| c == '\u{a0}'));
            }
            continue;
        }
        if let Some(element) = child.as_element() {
            let tag = element.name.local.to_string();
            if tag == "br" {
                out.push('\n');
                continue;
            }
            let is_block = BLOCK_TAGS.contains(&tag.as_str());
            if is_block && !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            if tag == "li" {
                out.push_str("- ");
            }
            collect_text(&child, out);
            if is_block && !out.ends_with('\n') {
                out.push('\n');
            }
        } else {
            collect_text(&child, out);
        }
    }
}

fn collapse_blank_lines(raw: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut last_blank = true;
    for line in raw.lines() {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() {
            if !last_blank {
                lines.push("");
            }
            last_blank = true;
        } else {
            lines.push(trimmed);
            last_blank = false;
        }
    }
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// Strip the quoted-reply chain from a rendered article body.
///
/// Replies carry the prior message below a quote marker; inside a thread
/// that content is already visible upstream, so it is cut rather than
/// reposted. Cuts at the first quote-marker line and everything below it.
pub fn strip_quoted_reply(text: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('>') || is_attribution_line(trimmed) {
            break;
        }
        kept.push(line);
    }
    let stripped = kept.join("\n").trim().to_string();
    if stripped.is_empty() {
        // A pure-quote body would otherwise vanish; keep the original.
        text.trim().to_string()
    } else {
        stripped
    }
}

fn is_attribution_line(line: &str) -> bool {
    let lowered = line.to_lowercase();
    if lowered.starts_with("-----original message") {
        return true;
    }
    (lowered.starts_with("on ") || lowered.starts_with("am "))
        && (lowered.trim_end().ends_with("wrote:") || lowered.trim_end().ends_with("schrieb:"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markup_and_keeps_blocks() {
        let html = "<html><head><style>p{}</style></head><body>\
                    <p>Hello <b>there</b></p><p>Second line</p></body></html>";
        assert_eq!(html_to_text(html), "Hello there\nSecond line");
    }

    #[test]
    fn br_becomes_newline_and_lists_get_bullets() {
        let html = "<div>top<br>bottom</div><ul><li>one</li><li>two</li></ul>";
        assert_eq!(html_to_text(html), "top\nbottom\n- one\n- two");
    }

    #[test]
    fn scripts_and_comments_dropped() {
        let html = "<p>visible</p><script>alert(1)</script><!-- hidden -->";
        assert_eq!(html_to_text(html), "visible");
    }

    #[test]
    fn blank_runs_collapse() {
        let html = "<p>a</p><p></p><p></p><p>b</p>";
        assert_eq!(html_to_text(html), "a\nb");
    }

    #[test]
    fn quote_chain_cut_at_marker() {
        let text = "Thanks, that fixed it.\n\nOn Tue, Jan 2 someone wrote:\n> old content\n> more";
        assert_eq!(strip_quoted_reply(text), "Thanks, that fixed it.");
    }

    #[test]
    fn quote_chain_cut_at_angle_lines() {
        let text = "New reply\n> quoted\n> quoted too";
        assert_eq!(strip_quoted_reply(text), "New reply");
    }

    #[test]
    fn pure_quote_body_kept_whole() {
        let text = "> the entire body is a quote";
        assert_eq!(strip_quoted_reply(text), text);
    }
}
