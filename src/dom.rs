use async_trait::async_trait;
use tracing::warn;

use crate::error::BrowserError;

/// JavaScript injected into the page to collect interactable elements.
/// NON-DESTRUCTIVE: reads the DOM and layout, never modifies them.
///
/// The script:
///   1. Collects candidates matching the interactive selectors, recursing into
///      every shadow root it finds.
///   2. Drops candidates that are zero-sized, hidden, transparent, disabled,
///      outside the viewport, or covered at their centre by an unrelated element.
///   3. Drops descendants of elements already accepted, so a button and its
///      inner label are reported once.
///   4. Returns the accepted elements' outerHTML as a JSON string array.
pub const EXTRACT_JS: &str = r#"
(() => {
  const SELECTORS = [
    'a[href]', 'button', 'input:not([type=hidden])', 'textarea',
    'select', '[role=button]', '[role=link]', '[onclick]'
  ].join(', ');

  const candidates = [];
  function collect(root) {
    root.querySelectorAll(SELECTORS).forEach(el => candidates.push(el));
    root.querySelectorAll('*').forEach(el => {
      if (el.shadowRoot) collect(el.shadowRoot);
    });
  }
  if (document.body) collect(document.body);

  const accepted = [];
  const out = [];
  for (const el of candidates) {
    if (accepted.some(p => p === el || p.contains(el))) continue;
    try {
      const rect = el.getBoundingClientRect();
      if (rect.width < 1 || rect.height < 1) continue;

      const style = window.getComputedStyle(el);
      if (style.display === 'none' || style.visibility === 'hidden' || style.opacity === '0') continue;
      if (el.hasAttribute('disabled') || el.disabled === true) continue;

      const inViewport = rect.top >= 0 && rect.left >= 0 &&
        rect.bottom <= window.innerHeight && rect.right <= window.innerWidth;
      if (!inViewport) continue;

      const cx = rect.left + rect.width / 2;
      const cy = rect.top + rect.height / 2;
      const root = el.getRootNode();
      const hit = (root && typeof root.elementFromPoint === 'function')
        ? root.elementFromPoint(cx, cy)
        : document.elementFromPoint(cx, cy);
      if (!hit || (hit !== el && !el.contains(hit))) continue;

      accepted.push(el);
      out.push(el.outerHTML);
    } catch (e) { /* detached while scanning */ }
  }
  return JSON.stringify(out);
})()
"#;

/// Produces the raw markup of every interactable element on the active page.
#[async_trait]
pub trait ElementSource: Send + Sync {
    async fn list_interactive_fragments(&self) -> Result<Vec<String>, BrowserError>;
}

/// Decode the value returned by [`EXTRACT_JS`].
///
/// Accepts either the JSON string the script returns or an already-decoded
/// array, which is what some drivers hand back for `returnByValue` calls.
pub fn decode_fragments(value: Option<serde_json::Value>) -> Result<Vec<String>, BrowserError> {
    match value {
        Some(serde_json::Value::String(raw)) => {
            serde_json::from_str(&raw).map_err(|e| BrowserError::Script(e.to_string()))
        }
        Some(serde_json::Value::Array(items)) => Ok(items
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                other => {
                    warn!(value = %other, "ignoring non-string fragment");
                    None
                }
            })
            .collect()),
        Some(other) => Err(BrowserError::Script(format!(
            "unexpected extractor result: {other}"
        ))),
        None => Err(BrowserError::Script("extractor returned nothing".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_json_string_result() {
        let value = json!(r#"["<a href=\"/\">Home</a>","<button>Go</button>"]"#);
        let fragments = decode_fragments(Some(value)).unwrap();
        assert_eq!(fragments, vec!["<a href=\"/\">Home</a>", "<button>Go</button>"]);
    }

    #[test]
    fn decodes_array_result() {
        let fragments = decode_fragments(Some(json!(["<button>Go</button>", 3]))).unwrap();
        assert_eq!(fragments, vec!["<button>Go</button>"]);
    }

    #[test]
    fn missing_result_is_an_error() {
        assert!(matches!(decode_fragments(None), Err(BrowserError::Script(_))));
        assert!(decode_fragments(Some(json!(42))).is_err());
    }

    #[test]
    fn script_covers_shadow_roots_and_occlusion() {
        assert!(EXTRACT_JS.contains("shadowRoot"));
        assert!(EXTRACT_JS.contains("elementFromPoint"));
        assert!(EXTRACT_JS.contains("[onclick]"));
    }
}
