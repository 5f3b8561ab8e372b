//! Template delimiters.
//!
//! Templates are executed by Tera, which only understands `{{ }}`. A set may
//! pick other delimiters through an annotation; such templates are rewritten
//! into Tera syntax before rendering, with literal text that happens to
//! contain Tera markers wrapped in a raw block.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

const DEFAULT_OPEN: &str = "{{";
const DEFAULT_CLOSE: &str = "}}";

/// `.Element.x` style paths: a dot at the start of an identifier that does not
/// follow another identifier or a closing bracket.
static LEADING_DOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[\s(\[,=|!+*/%<>~-])\.([A-Za-z_])").unwrap());

/// The open and close markers of template expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiters {
    open: String,
    close: String,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            open: DEFAULT_OPEN.to_string(),
            close: DEFAULT_CLOSE.to_string(),
        }
    }
}

impl Delimiters {
    /// Parses an `"<open>,<close>"` annotation value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let (open, close) = value.split_once(',')?;
        let (open, close) = (open.trim(), close.trim());
        if open.is_empty() || close.is_empty() || close.contains(',') {
            return None;
        }
        Some(Self {
            open: open.to_string(),
            close: close.to_string(),
        })
    }

    fn is_default(&self) -> bool {
        self.open == DEFAULT_OPEN && self.close == DEFAULT_CLOSE
    }

    /// Returns true if `input` holds at least one expression.
    #[must_use]
    pub fn has_expression(&self, input: &str) -> bool {
        input.contains(self.open.as_str()) || (self.is_default() && input.contains("{%"))
    }

    /// The expression inside `input` when `input` consists of exactly one
    /// expression, ignoring surrounding whitespace.
    #[must_use]
    pub fn single_expression<'a>(&self, input: &'a str) -> Option<&'a str> {
        let trimmed = input.trim();
        let inner = trimmed
            .strip_prefix(self.open.as_str())?
            .strip_suffix(self.close.as_str())?;
        let nested = inner.contains(self.open.as_str()) || inner.contains(self.close.as_str());
        let block = self.is_default() && (inner.contains("{%") || inner.contains("%}"));
        let inner = inner.trim();
        (!nested && !block && !inner.is_empty()).then_some(inner)
    }

    /// Rewrites `input` into Tera syntax.
    #[must_use]
    pub fn to_tera(&self, input: &str) -> String {
        if self.is_default() {
            normalize_tags(input)
        } else {
            self.translate(input)
        }
    }

    fn translate(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find(self.open.as_str()) {
            let after_open = &rest[start + self.open.len()..];
            let Some(end) = after_open.find(self.close.as_str()) else {
                break;
            };
            push_literal(&mut out, &rest[..start]);
            out.push_str("{{ ");
            out.push_str(&normalize_expression(after_open[..end].trim()));
            out.push_str(" }}");
            rest = &after_open[end + self.close.len()..];
        }
        push_literal(&mut out, rest);
        out
    }
}

fn push_literal(out: &mut String, literal: &str) {
    if literal.contains("{{") || literal.contains("{%") || literal.contains("{#") {
        out.push_str("{% raw %}");
        out.push_str(literal);
        out.push_str("{% endraw %}");
    } else {
        out.push_str(literal);
    }
}

/// Normalizes Go-style paths inside `{{ }}` and `{% %}` tags. `{#` is not a
/// comment marker here, so text holding one is kept verbatim.
fn normalize_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    loop {
        let next = ["{{", "{%"]
            .iter()
            .filter_map(|open| rest.find(open).map(|pos| (pos, *open)))
            .min_by_key(|(pos, _)| *pos);
        let Some((start, open)) = next else {
            break;
        };
        let close = if open == "{{" { "}}" } else { "%}" };
        let after_open = &rest[start + open.len()..];
        let Some(end) = after_open.find(close) else {
            break;
        };
        push_text(&mut out, &rest[..start]);
        out.push_str(open);
        out.push_str(&normalize_expression(&after_open[..end]));
        out.push_str(close);
        rest = &after_open[end + close.len()..];
    }
    push_text(&mut out, rest);
    out
}

fn push_text(out: &mut String, text: &str) {
    if text.contains("{#") {
        out.push_str("{% raw %}");
        out.push_str(text);
        out.push_str("{% endraw %}");
    } else {
        out.push_str(text);
    }
}

/// Strips the leading dot of Go-style paths, so `.Element.name` reads as
/// `Element.name`.
#[must_use]
pub fn normalize_expression(expression: &str) -> Cow<'_, str> {
    LEADING_DOT.replace_all(expression, "${1}${2}")
}
