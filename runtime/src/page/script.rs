//! JavaScript snippets evaluated by the Chromium provider.
//!
//! Every script installs (once per document) a small element registry on
//! `window.__trellis`: elements get numeric ids held through `WeakRef`, and
//! mutation observers push records into a shared buffer that the engine
//! drains. Each script evaluates to `{ ok: … }`, `{ detached: true }` or
//! `{ error: "…" }`.
//!
//! ## Security: JS encoding
//!
//! Caller-provided strings (selectors, typed text, attribute names) are only
//! ever injected into single-quoted string literals, after
//! [`sanitize_js_string`]. Structured values go through `serde_json`, whose
//! output is a valid JS literal.

use super::{ElementRef, PageError, SubscriptionId};
use crate::ops::{ExtractField, Operation, ScrollDirection};

const PRELUDE: &str = r#"
    const reg = (window.__trellis = window.__trellis || {
        next: 1, byId: new Map(), ids: new WeakMap(),
        nextSub: 1, observers: new Map(), mutations: [], dirty: new Set()
    });
    const idOf = (el) => {
        let id = reg.ids.get(el);
        if (id === undefined) {
            id = reg.next++;
            reg.ids.set(el, id);
            reg.byId.set(id, new WeakRef(el));
        }
        return String(id);
    };
    const byId = (id) => {
        const ref = reg.byId.get(id);
        const el = ref && ref.deref();
        return el && el.isConnected ? el : null;
    };
"#;

/// Numeric registry id behind an element reference.
pub fn element_id(element: &ElementRef) -> Result<u64, PageError> {
    element
        .as_str()
        .parse::<u64>()
        .map_err(|_| PageError::Detached(element.clone()))
}

fn wrap(body: &str) -> String {
    format!("(() => {{ {PRELUDE} try {{ {body} }} catch (e) {{ return {{ error: String(e && e.message || e) }}; }} }})()")
}

/// Query all matches of `selector` inside `scope` (or the document).
pub fn query_all(scope: Option<&ElementRef>, selector: &str) -> Result<String, PageError> {
    let scope_expr = match scope {
        Some(el) => format!("byId({})", element_id(el)?),
        None => "document".to_string(),
    };
    Ok(wrap(&format!(
        r#"const scope = {scope_expr};
           if (!scope) return {{ detached: true }};
           return {{ ok: Array.from(scope.querySelectorAll('{}')).map(idOf) }};"#,
        sanitize_js_string(selector)
    )))
}

/// Bounding rect plus computed display/visibility, or null when detached.
pub fn element_state(element: &ElementRef) -> Result<String, PageError> {
    Ok(wrap(&format!(
        r#"const el = byId({});
           if (!el) return {{ ok: null }};
           const r = el.getBoundingClientRect();
           const s = window.getComputedStyle(el);
           return {{ ok: {{
               rect: {{ x: r.x, y: r.y, width: r.width, height: r.height }},
               display: s.display, visibility: s.visibility
           }} }};"#,
        element_id(element)?
    )))
}

/// Perform one operation against an element.
pub fn perform(element: &ElementRef, operation: &Operation) -> Result<String, PageError> {
    let action = match operation {
        Operation::Click => r#"
            el.scrollIntoView({ block: 'center', inline: 'center' });
            el.click();
            return { ok: { kind: 'clicked' } };"#
            .to_string(),
        Operation::Type { text, clear_first } => format!(
            r#"
            const text = '{}';
            el.focus();
            if ('value' in el) {{
                el.value = ({clear_first} ? '' : el.value) + text;
            }} else {{
                el.textContent = ({clear_first} ? '' : el.textContent) + text;
            }}
            el.dispatchEvent(new Event('input', {{ bubbles: true }}));
            el.dispatchEvent(new Event('change', {{ bubbles: true }}));
            return {{ ok: {{ kind: 'typed', chars: text.length }} }};"#,
            sanitize_js_string(text)
        ),
        Operation::Scroll {
            direction,
            amount_px,
        } => {
            let amount = amount_px
                .map(|px| px.to_string())
                .unwrap_or_else(|| "el.clientHeight".to_string());
            let step = match direction {
                ScrollDirection::Down => format!("el.scrollBy(0, {amount});"),
                ScrollDirection::Up => format!("el.scrollBy(0, -({amount}));"),
                ScrollDirection::ToEnd => "el.scrollTop = el.scrollHeight;".to_string(),
                ScrollDirection::ToStart => "el.scrollTop = 0;".to_string(),
            };
            format!(
                r#"
            {step}
            const atEnd = el.scrollTop + el.clientHeight >= el.scrollHeight - 1;
            return {{ ok: {{ kind: 'scrolled', scroll_top: el.scrollTop, at_end: atEnd }} }};"#
            )
        }
        Operation::Extract { fields } => format!(
            r#"
            const fields = {};
            const values = {{}};
            for (const f of fields) {{
                const target = f.selector ? el.querySelector(f.selector) : el;
                values[f.name] = !target ? null
                    : f.attribute ? target.getAttribute(f.attribute)
                    : target.textContent.replace(/\s+/g, ' ').trim();
            }}
            return {{ ok: {{ kind: 'extracted', values }} }};"#,
            fields_literal(fields)
        ),
        Operation::Hover => r#"
            for (const type of ['pointerover', 'mouseover', 'mouseenter']) {
                el.dispatchEvent(new MouseEvent(type, { bubbles: type !== 'mouseenter' }));
            }
            return { ok: { kind: 'hovered' } };"#
            .to_string(),
        Operation::Focus => r#"
            el.focus();
            return { ok: { kind: 'focused' } };"#
            .to_string(),
    };

    Ok(wrap(&format!(
        "const el = byId({}); if (!el) return {{ detached: true }}; {action}",
        element_id(element)?
    )))
}

/// Attach a `MutationObserver` to an element's subtree.
///
/// Records are de-duplicated per (subscription, kind) until drained.
pub fn observe(element: &ElementRef) -> Result<String, PageError> {
    Ok(wrap(&format!(
        r#"const el = byId({});
           if (!el) return {{ detached: true }};
           const sub = reg.nextSub++;
           const obs = new MutationObserver((records) => {{
               for (const r of records) {{
                   const key = sub + ':' + r.type;
                   if (!reg.dirty.has(key)) {{
                       reg.dirty.add(key);
                       reg.mutations.push({{ subscription: sub, kind: r.type }});
                   }}
               }}
           }});
           obs.observe(el, {{ childList: true, subtree: true, attributes: true, characterData: true }});
           reg.observers.set(sub, obs);
           return {{ ok: sub }};"#,
        element_id(element)?
    )))
}

pub fn unobserve(subscription: SubscriptionId) -> String {
    wrap(&format!(
        r#"const obs = reg.observers.get({0});
           if (!obs) return {{ error: 'unknown subscription {0}' }};
           obs.disconnect();
           reg.observers.delete({0});
           return {{ ok: true }};"#,
        subscription.0
    ))
}

pub fn take_mutations() -> String {
    wrap(
        r#"const out = reg.mutations;
           reg.mutations = [];
           reg.dirty.clear();
           return { ok: out };"#,
    )
}

fn fields_literal(fields: &[ExtractField]) -> String {
    // JSON is a JS literal; an empty list still yields a usable script.
    serde_json::to_string(fields).unwrap_or_else(|_| "[]".to_string())
}

/// Escape a string for a single-quoted JavaScript literal. Angle brackets
/// are hex-escaped as well, and null bytes are dropped.
pub fn sanitize_js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        let escaped = match ch {
            '\0' => continue,
            '\\' => r"\\",
            '\'' => r"\'",
            '"' => r#"\""#,
            '`' => r"\`",
            '\n' => r"\n",
            '\r' => r"\r",
            '\t' => r"\t",
            '<' => r"\x3c",
            '>' => r"\x3e",
            '\u{2028}' => r"\u2028",
            '\u{2029}' => r"\u2029",
            other => {
                out.push(other);
                continue;
            }
        };
        out.push_str(escaped);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_basic() {
        assert_eq!(sanitize_js_string("hello"), "hello");
        assert_eq!(sanitize_js_string("it's"), "it\\'s");
        assert_eq!(sanitize_js_string("a\"b"), "a\\\"b");
    }

    #[test]
    fn test_sanitize_injection() {
        let sanitized = sanitize_js_string("'); alert(1); ('");
        assert_eq!(sanitized, r"\'); alert(1); (\'");
        let quotes: Vec<usize> = sanitized.match_indices('\'').map(|(i, _)| i).collect();
        assert_eq!(quotes.len(), 2);
        assert!(quotes.iter().all(|&i| i > 0 && &sanitized[i - 1..i] == "\\"));
    }

    #[test]
    fn test_sanitize_script_close_and_nulls() {
        let sanitized = sanitize_js_string("</script>\0");
        assert_eq!(sanitized, "\\x3c/script\\x3e");
    }

    #[test]
    fn test_query_scopes() {
        let doc = query_all(None, "div.item > a[href='x']").unwrap();
        assert!(doc.contains("const scope = document;"));
        assert!(doc.contains(r"querySelectorAll('div.item \x3e a[href=\'x\']')"));

        let scoped = query_all(Some(&ElementRef::new("17")), ".item").unwrap();
        assert!(scoped.contains("byId(17)"));
    }

    #[test]
    fn test_non_numeric_ref_is_detached() {
        let err = element_state(&ElementRef::new("key:abc")).unwrap_err();
        assert_eq!(err, PageError::Detached(ElementRef::new("key:abc")));
    }

    #[test]
    fn test_perform_scripts_per_kind() {
        let el = ElementRef::new("5");
        let typed = perform(
            &el,
            &Operation::Type {
                text: "o'neil\n".into(),
                clear_first: true,
            },
        )
        .unwrap();
        assert!(typed.contains(r"const text = 'o\'neil\n';"));
        assert!(typed.contains("(true ? '' : el.value)"));

        let scroll = perform(
            &el,
            &Operation::Scroll {
                direction: ScrollDirection::Down,
                amount_px: Some(400),
            },
        )
        .unwrap();
        assert!(scroll.contains("el.scrollBy(0, 400);"));

        let extract = perform(
            &el,
            &Operation::Extract {
                fields: vec![ExtractField::attribute("link", Some("a"), "href")],
            },
        )
        .unwrap();
        assert!(extract.contains(r#""attribute":"href""#));
        assert!(extract.contains("kind: 'extracted'"));
    }

    #[test]
    fn test_observer_scripts() {
        let observe = observe(&ElementRef::new("3")).unwrap();
        assert!(observe.contains("new MutationObserver"));
        assert!(unobserve(SubscriptionId(9)).contains("reg.observers.get(9)"));
        assert!(take_mutations().contains("reg.mutations = [];"));
    }
}
