//! Turns raw element markup into the indexed element list the model sees.
//!
//! Each fragment is the `outerHTML` of one interactive element. Only the root
//! start tag and the element's text matter here, so the fragment is read with
//! a handful of regexes instead of a full HTML parser.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::types::ElementDescriptor;

static START_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([A-Za-z][A-Za-z0-9-]*)").expect("valid start tag regex"));

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("valid attribute regex")
});

static NON_TEXT_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<!--.*?-->|<script\b.*?</script\s*>|<style\b.*?</style\s*>")
        .expect("valid block regex")
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid ws regex"));

static CSS_IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?[A-Za-z_][A-Za-z0-9_-]*$").expect("valid identifier regex")
});

/// Root element of a fragment: its tag, attributes and visible text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFragment {
    pub tag: String,
    pub attributes: HashMap<String, String>,
    pub text_content: String,
}

impl ParsedFragment {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// `aria-label` wins over rendered text.
    pub fn visible_text(&self) -> String {
        match self.attr("aria-label") {
            Some(label) => label.trim().to_string(),
            None => self.text_content.clone(),
        }
    }

    /// Most specific selector available: id, data-testid, aria-label, name,
    /// text, then the bare tag.
    pub fn selector(&self) -> String {
        let tag = &self.tag;
        if let Some(id) = self.attr("id") {
            return if CSS_IDENT.is_match(id) {
                format!("#{id}")
            } else {
                format!("{tag}[id='{}']", escape_quotes(id))
            };
        }
        if let Some(test_id) = self.attr("data-testid") {
            return format!("{tag}[data-testid='{}']", escape_quotes(test_id));
        }
        if let Some(label) = self.attr("aria-label") {
            return format!("{tag}[aria-label='{}']", escape_quotes(label));
        }
        if let Some(name) = self.attr("name") {
            return format!("{tag}[name='{}']", escape_quotes(name));
        }
        let text = self.visible_text();
        if !text.is_empty() {
            return format!("{tag}:has-text('{}')", escape_quotes(&text));
        }
        tag.clone()
    }
}

/// Parse the first element in `fragment`. `None` if there is no element.
pub fn parse_fragment(fragment: &str) -> Option<ParsedFragment> {
    let open = START_TAG.captures(fragment)?;
    let whole = open.get(0)?;
    let tag = open[1].to_ascii_lowercase();

    let rest = &fragment[whole.end()..];
    let attr_len = start_tag_len(rest)?;
    let attributes = parse_attributes(&rest[..attr_len]);

    let body = &rest[(attr_len + 1).min(rest.len())..];
    let text_content = extract_text(body);

    Some(ParsedFragment {
        tag,
        attributes,
        text_content,
    })
}

/// Analyze one turn's fragments. Unparseable fragments are dropped and the
/// remaining elements are indexed by their position in the output.
pub fn analyze(fragments: &[String]) -> Vec<ElementDescriptor> {
    let elements: Vec<ElementDescriptor> = fragments
        .iter()
        .filter_map(|raw| {
            let parsed = parse_fragment(raw);
            if parsed.is_none() {
                debug!(fragment = %truncate(raw, 80), "skipping fragment without an element");
            }
            parsed
        })
        .enumerate()
        .map(|(index, parsed)| ElementDescriptor {
            index,
            selector: parsed.selector(),
            text: parsed.visible_text(),
            tag: parsed.tag,
        })
        .collect();

    info!(
        fragments = fragments.len(),
        elements = elements.len(),
        "analyzed interactive elements"
    );
    elements
}

/// Length of the attribute section up to the closing `>`, ignoring `>` in quotes.
fn start_tag_len(rest: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in rest.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(i),
            (None, _) => {}
        }
    }
    None
}

fn parse_attributes(section: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    for caps in ATTRIBUTE.captures_iter(section) {
        let name = caps[1].to_ascii_lowercase();
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map(|m| decode_entities(m.as_str()))
            .unwrap_or_default();
        // First occurrence wins, as in browsers.
        attributes.entry(name).or_insert(value);
    }
    attributes
}

/// Replace every tag in `html` with a space. Quoted attribute values may
/// contain `>`.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(lt) = rest.find('<') {
        out.push_str(&rest[..lt]);
        let after = &rest[lt + 1..];
        let opens_tag = after.starts_with(|c: char| c.is_ascii_alphabetic() || c == '/' || c == '!');
        match start_tag_len(after).filter(|_| opens_tag) {
            Some(len) => {
                out.push(' ');
                rest = &after[len + 1..];
            }
            None => {
                out.push('<');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn extract_text(body: &str) -> String {
    let without_blocks = NON_TEXT_BLOCKS.replace_all(body, " ");
    let without_tags = strip_tags(&without_blocks);
    let decoded = decode_entities(&without_tags);
    WHITESPACE.replace_all(decoded.trim(), " ").into_owned()
}

fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        match tail.find(';').filter(|&end| end <= 10) {
            Some(end) => match decode_entity(&tail[1..end]) {
                Some(ch) => {
                    out.push(ch);
                    rest = &tail[end + 1..];
                }
                None => {
                    out.push('&');
                    rest = &tail[1..];
                }
            },
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code)
        }
    }
}

/// Escape for a single-quoted CSS string. Line breaks become CSS escapes.
fn escape_quotes(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('"', "\\\"")
        .replace('\n', "\\a ")
        .replace('\r', "\\d ")
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(fragment: &str) -> ElementDescriptor {
        let mut out = analyze(&[fragment.to_string()]);
        assert_eq!(out.len(), 1, "expected one element from {fragment}");
        out.remove(0)
    }

    #[test]
    fn id_beats_aria_label() {
        let el = one(r#"<button id="submit" aria-label="Send form">Submit</button>"#);
        assert_eq!(el.selector, "#submit");
        assert_eq!(el.text, "Send form");
        assert_eq!(el.tag, "button");
    }

    #[test]
    fn selector_priority_falls_through() {
        assert_eq!(
            one(r#"<a href="/x" data-testid="nav-home" name="home">Home</a>"#).selector,
            "a[data-testid='nav-home']"
        );
        assert_eq!(
            one(r#"<button aria-label="Close">x</button>"#).selector,
            "button[aria-label='Close']"
        );
        assert_eq!(
            one(r#"<input type="email" name="email">"#).selector,
            "input[name='email']"
        );
        assert_eq!(
            one(r#"<a href="/login">  Log   in </a>"#).selector,
            "a:has-text('Log in')"
        );
        assert_eq!(one(r#"<select></select>"#).selector, "select");
    }

    #[test]
    fn empty_attributes_are_ignored() {
        let el = one(r#"<button id="" name="go">Go</button>"#);
        assert_eq!(el.selector, "button[name='go']");
    }

    #[test]
    fn odd_ids_use_attribute_form() {
        let el = one(r#"<button id="form:save">Save</button>"#);
        assert_eq!(el.selector, "button[id='form:save']");
    }

    #[test]
    fn text_selector_escapes_quotes() {
        let el = one(r#"<button>Don't "panic"</button>"#);
        assert_eq!(el.selector, r#"button:has-text('Don\'t \"panic\"')"#);
    }

    #[test]
    fn nested_markup_and_entities_are_flattened() {
        let el = one(
            "<a href=\"/p\"><span class=\"icon\"></span><b>Terms</b> &amp; Conditions<!-- x --></a>",
        );
        assert_eq!(el.text, "Terms & Conditions");
    }

    #[test]
    fn quoted_gt_does_not_end_the_tag() {
        let el = one(r#"<button data-x="a>b" id="ok">Fine</button>"#);
        assert_eq!(el.selector, "#ok");
        assert_eq!(el.text, "Fine");
    }

    #[test]
    fn quoted_gt_in_nested_tags_stays_out_of_the_text() {
        let el = one(r#"<a href="/"><img alt="a > b" src="x.png">Home</a>"#);
        assert_eq!(el.text, "Home");
        assert_eq!(el.selector, "a:has-text('Home')");
    }

    #[test]
    fn stray_angle_brackets_are_text() {
        let el = one("<button>1 < 2 and 3 > 2</button>");
        assert_eq!(el.text, "1 < 2 and 3 > 2");
    }

    #[test]
    fn line_breaks_in_attribute_selectors_are_escaped() {
        let el = one("<button aria-label=\"Save\nand close\">x</button>");
        assert_eq!(el.selector, "button[aria-label='Save\\a and close']");
        assert!(!el.selector.contains('\n'));
        let el = one("<input name=\"a\r\nb\">");
        assert_eq!(el.selector, "input[name='a\\d \\a b']");
    }

    #[test]
    fn unparseable_fragments_leave_no_index_gap() {
        let fragments = vec![
            "<button id=\"a\">A</button>".to_string(),
            "just some text".to_string(),
            "<button id=\"b\">B</button>".to_string(),
        ];
        let out = analyze(&fragments);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].index, 0);
        assert_eq!(out[1].index, 1);
        assert_eq!(out[1].selector, "#b");
    }

    #[test]
    fn order_is_preserved() {
        let fragments: Vec<String> = (0..5)
            .map(|i| format!("<button id=\"b{i}\">B{i}</button>"))
            .collect();
        let out = analyze(&fragments);
        for (i, el) in out.iter().enumerate() {
            assert_eq!(el.index, i);
            assert_eq!(el.selector, format!("#b{i}"));
        }
    }

    #[test]
    fn truncate_counts_chars() {
        assert_eq!(truncate("héllo", 10), "héllo");
        assert_eq!(truncate("héllo world", 5), "héllo...");
    }
}
