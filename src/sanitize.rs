use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^<(/?)([A-Za-z][A-Za-z0-9:_-]*)((?:[^<>"']|"[^"<]*"|'[^'<]*')*?)(/?)>"#).unwrap()
});
/// A noise tag opener, including one assembled from fragments left around a
/// removed element (`<<script></script>script>`).
static NOISE_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<+(script|style|link|svg)").unwrap());
static CLASS_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|\s)class\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Elements removed together with everything inside them.
const NOISE_ELEMENTS: &[&str] = &["script", "style", "link", "svg"];
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

/// Review widget vendors we can recognise by their container classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    JudgeMe,
    Yotpo,
    Okendo,
    Stamped,
}

impl Vendor {
    fn detect(classes: &[&str]) -> Option<Self> {
        let has = |c: &str| classes.contains(&c);
        if has("jdgm-widget") && (has("jdgm-review-widget") || has("jdgm-all-reviews-widget")) {
            Some(Self::JudgeMe)
        } else if has("yotpo-main-reviews-widget") {
            Some(Self::Yotpo)
        } else if has("okeReviews-reviewsWidget") {
            Some(Self::Okendo)
        } else if has("stamped-main-widget") {
            Some(Self::Stamped)
        } else {
            None
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::JudgeMe => "Judge.me",
            Self::Yotpo => "Yotpo",
            Self::Okendo => "Okendo",
            Self::Stamped => "Stamped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub html: String,
    /// Widget whose subtree was isolated, if any.
    pub vendor: Option<Vendor>,
    /// A widget matched but its markup never closed; the full document was kept.
    pub degraded: bool,
}

/// Isolate the review widget (when recognisable), drop scripts, styles,
/// stylesheet links and inline SVG, and collapse whitespace.
pub fn sanitize(raw: &str) -> Sanitized {
    let (section, vendor, degraded) = match isolate_review_section(raw) {
        Isolation::Found(vendor, range) => {
            info!("Isolated {} review widget ({} of {} bytes)", vendor, range.len(), raw.len());
            (&raw[range], Some(vendor), false)
        }
        Isolation::Unbalanced(vendor) => {
            warn!("{} review widget never closes; keeping the full document", vendor);
            (raw, None, true)
        }
        Isolation::NotFound => {
            info!("Review section not found by vendor signature; keeping the full document");
            (raw, None, false)
        }
    };

    let stripped = strip_noise(section);
    let html = collapse_whitespace(&stripped);
    debug!("Sanitized HTML: {} -> {} bytes", raw.len(), html.len());

    Sanitized {
        html,
        vendor,
        degraded,
    }
}

pub fn collapse_whitespace(s: &str) -> String {
    WS_RE.replace_all(s, " ").trim().to_string()
}

// ── Tokenizer ──

#[derive(Debug)]
enum TokenKind<'a> {
    Open {
        name: String,
        attrs: &'a str,
        self_closing: bool,
    },
    Close {
        name: String,
    },
    /// A whole `<script>`/`<style>` element, contents included.
    RawText,
    /// Comments, doctypes, processing instructions.
    Declaration,
    /// A `<` that starts something noise-like but never forms a tag.
    Broken,
}

#[derive(Debug)]
struct Token<'a> {
    kind: TokenKind<'a>,
    span: Range<usize>,
}

/// Walks markup without building a tree. Quoted attribute values and
/// raw-text elements are understood; everything else is left as text.
/// A tag never spans a `<`, so a match attempt ends at the next one.
struct Scanner<'a> {
    src: &'a str,
    lower: String,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            lower: src.to_ascii_lowercase(),
            pos: 0,
        }
    }

    fn end_of(&self, needle: &str, from: usize) -> usize {
        self.lower[from..]
            .find(needle)
            .map(|i| from + i + needle.len())
            .unwrap_or(self.src.len())
    }

    fn raw_text_end(&self, name: &str, from: usize) -> usize {
        let close = format!("</{}", name);
        match self.lower[from..].find(&close) {
            Some(i) => self.end_of(">", from + i),
            None => self.src.len(),
        }
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let src = self.src;
        loop {
            let start = self.pos + src[self.pos..].find('<')?;
            let rest = &self.lower[start..];

            if rest.starts_with("<!--") {
                let end = self.end_of("-->", start + 4);
                self.pos = end;
                return Some(Token {
                    kind: TokenKind::Declaration,
                    span: start..end,
                });
            }
            if rest.starts_with("<!") || rest.starts_with("<?") {
                let end = self.end_of(">", start);
                self.pos = end;
                return Some(Token {
                    kind: TokenKind::Declaration,
                    span: start..end,
                });
            }

            if let Some(caps) = TAG_RE.captures(&src[start..]) {
                let end = start + caps[0].len();
                let name = caps[2].to_ascii_lowercase();
                self.pos = end;

                if !caps[1].is_empty() {
                    return Some(Token {
                        kind: TokenKind::Close { name },
                        span: start..end,
                    });
                }

                let self_closing = !caps[4].is_empty();
                if RAW_TEXT_ELEMENTS.contains(&name.as_str()) && !self_closing {
                    let end = self.raw_text_end(&name, end);
                    self.pos = end;
                    return Some(Token {
                        kind: TokenKind::RawText,
                        span: start..end,
                    });
                }

                let attrs = caps.get(3).map(|m| m.as_str()).unwrap_or("");
                return Some(Token {
                    kind: TokenKind::Open {
                        name,
                        attrs,
                        self_closing,
                    },
                    span: start..end,
                });
            }

            if starts_noise_tag(rest) {
                let end = self.end_of(">", start);
                self.pos = end;
                return Some(Token {
                    kind: TokenKind::Broken,
                    span: start..end,
                });
            }

            // A bare '<' in text.
            self.pos = start + 1;
        }
    }
}

fn starts_noise_tag(lower_rest: &str) -> bool {
    let rest = lower_rest.strip_prefix('<').unwrap_or(lower_rest);
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    NOISE_ELEMENTS.iter().any(|n| rest.starts_with(n))
}

fn is_noise_name(name: &str) -> bool {
    NOISE_ELEMENTS.iter().any(|n| name.starts_with(n))
}

fn class_tokens(attrs: &str) -> Vec<&str> {
    CLASS_ATTR_RE
        .captures(attrs)
        .and_then(|c| c.get(1).or_else(|| c.get(2)).or_else(|| c.get(3)))
        .map(|m| m.as_str().split_whitespace().collect())
        .unwrap_or_default()
}

// ── Review section isolation ──

#[derive(Debug, PartialEq, Eq)]
enum Isolation {
    Found(Vendor, Range<usize>),
    Unbalanced(Vendor),
    NotFound,
}

fn isolate_review_section(html: &str) -> Isolation {
    let mut scanner = Scanner::new(html);

    let (vendor, start) = loop {
        let Some(token) = scanner.next() else {
            return Isolation::NotFound;
        };
        if let TokenKind::Open {
            name,
            attrs,
            self_closing: false,
        } = &token.kind
        {
            if name == "div" {
                if let Some(vendor) = Vendor::detect(&class_tokens(attrs)) {
                    break (vendor, token.span.start);
                }
            }
        }
    };

    let mut depth = 1usize;
    for token in scanner {
        match token.kind {
            TokenKind::Open {
                name,
                self_closing: false,
                ..
            } if name == "div" => depth += 1,
            TokenKind::Close { name } if name == "div" => {
                depth -= 1;
                if depth == 0 {
                    return Isolation::Found(vendor, start..token.span.end);
                }
            }
            _ => {}
        }
    }

    Isolation::Unbalanced(vendor)
}

// ── Noise stripping ──

fn strip_noise(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    let mut svg_depth = 0usize;

    for token in Scanner::new(html) {
        if svg_depth == 0 {
            out.push_str(&html[last..token.span.start]);
        }
        last = token.span.end;

        let keep = match &token.kind {
            TokenKind::RawText | TokenKind::Declaration | TokenKind::Broken => false,
            TokenKind::Open {
                name, self_closing, ..
            } => {
                if name == "svg" && !self_closing {
                    svg_depth += 1;
                }
                !is_noise_name(name)
            }
            TokenKind::Close { name } => {
                if name == "svg" {
                    svg_depth = svg_depth.saturating_sub(1);
                    // The closing tag of the outermost svg is itself dropped.
                    false
                } else {
                    !is_noise_name(name)
                }
            }
        };

        if keep && svg_depth == 0 {
            out.push_str(&html[token.span]);
        }
    }

    if svg_depth == 0 {
        out.push_str(&html[last..]);
    }
    NOISE_OPEN_RE.replace_all(&out, "$1").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    fn assert_clean(html: &str) {
        let lower = html.to_ascii_lowercase();
        for tag in ["<script", "<style", "<link", "<svg"] {
            assert!(!lower.contains(tag), "{} survived in {:?}", tag, html);
        }
    }

    #[test]
    fn judgeme_widget_is_isolated() {
        let raw = fixture("judgeme_page");
        let out = sanitize(&raw);
        assert_eq!(out.vendor, Some(Vendor::JudgeMe));
        assert!(!out.degraded);
        assert!(out.html.starts_with("<div class=\"jdgm-widget jdgm-review-widget"));
        assert!(out.html.ends_with("</div>"));
        assert!(out.html.contains("Lovely product"));
        assert!(out.html.contains("jdgm-paginate__next-page"));
        assert!(!out.html.contains("Site navigation"));
        assert!(!out.html.contains("Footer links"));
        assert_clean(&out.html);
        assert!(out.html.len() <= raw.len());
    }

    #[test]
    fn no_widget_keeps_full_document() {
        let raw = "<header>Shop</header>\n<div class=\"reviews\">  <p>Great</p>\n</div>";
        let out = sanitize(raw);
        assert_eq!(out.vendor, None);
        assert!(!out.degraded);
        assert_eq!(out.html, "<header>Shop</header> <div class=\"reviews\"> <p>Great</p> </div>");
    }

    #[test]
    fn unbalanced_widget_falls_back_to_full_document() {
        let raw = "<nav>menu</nav><div class=\"yotpo-bold-layout yotpo-main-reviews-widget\"><div class=\"yotpo-review\">Nice";
        let out = sanitize(raw);
        assert!(out.degraded);
        assert_eq!(out.vendor, None);
        assert!(out.html.contains("<nav>menu</nav>"));
        assert!(out.html.contains("Nice"));
    }

    #[test]
    fn nested_divs_are_followed_to_the_matching_close() {
        let raw = concat!(
            "<p>before</p>",
            "<div class='okeReviews-reviewsWidget okeReviews-reviewsWidget--minimal'>",
            "<div><div>inner</div></div><span>tail</span>",
            "</div>",
            "<p>after</p>"
        );
        let out = sanitize(raw);
        assert_eq!(out.vendor, Some(Vendor::Okendo));
        assert!(out.html.contains("tail"));
        assert!(!out.html.contains("before"));
        assert!(!out.html.contains("after"));
    }

    #[test]
    fn div_markup_inside_scripts_does_not_count() {
        let raw = concat!(
            "<div class=\"stamped-main-widget\">",
            "<script>var s = '</div><div>';</script>",
            "<p>kept</p></div><p>outside</p>"
        );
        let out = sanitize(raw);
        assert_eq!(out.vendor, Some(Vendor::Stamped));
        assert_eq!(out.html, "<div class=\"stamped-main-widget\"><p>kept</p></div>");
    }

    #[test]
    fn noise_elements_and_their_contents_are_removed() {
        let raw = concat!(
            "<div>a<script type=\"text/javascript\">if (x > 1) { alert('<b>'); }</script>b",
            "<STYLE>.x { color: red }</STYLE>c",
            "<link rel=\"stylesheet\" href=\"/a.css\">d",
            "<svg viewBox=\"0 0 10 10\"><g><svg><path d=\"M0\"/></svg></g><text>star</text></svg>e",
            "<!-- tracking -->f</div>"
        );
        let out = sanitize(raw);
        assert_eq!(out.html, "<div>abcdef</div>");
    }

    #[test]
    fn quoted_angle_brackets_do_not_end_tags() {
        let raw = "<span data-x=\"a > b\" class=\"rating\" data-score=\"5\">5</span>";
        let out = sanitize(raw);
        assert_eq!(out.html, raw);
    }

    #[test]
    fn unterminated_noise_drops_the_tail() {
        let out = sanitize("<p>keep</p><script>never closed <div>");
        assert_eq!(out.html, "<p>keep</p>");
        let out = sanitize("<p>keep</p><svg><path>");
        assert_eq!(out.html, "<p>keep</p>");
        let out = sanitize("<p>keep</p><script");
        assert_eq!(out.html, "<p>keep</p>");
    }

    #[test]
    fn lookalike_custom_elements_lose_only_their_tags() {
        let out = sanitize("<style-guide>text</style-guide><linkedin-badge>me</linkedin-badge>");
        assert_eq!(out.html, "textme");
        assert_clean(&out.html);
    }

    #[test]
    fn bare_less_than_is_text() {
        let out = sanitize("<p>3 < 4 and 5<6</p>");
        assert_eq!(out.html, "<p>3 < 4 and 5<6</p>");
    }

    #[test]
    fn fragments_around_removed_elements_do_not_rejoin() {
        let cases = [
            ("<<script>x</script>script>alert(1)", "script>alert(1)"),
            ("<<svg></svg>svg onload=1>", "svg onload=1>"),
            ("<<!-- c -->style>", "style>"),
            ("<<link rel=a>link href=b>", "link href=b>"),
            ("<scr<script>ipt>", "<scr"),
        ];
        for (input, expected) in cases {
            let out = sanitize(input);
            assert_eq!(out.html, expected, "for {:?}", input);
            assert_clean(&out.html);
        }
    }

    #[test]
    fn unquoted_less_than_ends_a_tag_candidate() {
        let out = sanitize("<p class=x <script>bad()</script>>ok");
        assert_eq!(out.html, "<p class=x >ok");
    }

    #[test]
    fn unclosed_quotes_scan_in_linear_time() {
        let raw = "<a x='".repeat(32_000);
        let t0 = std::time::Instant::now();
        let out = sanitize(&raw);
        assert_eq!(out.html, raw);
        assert!(t0.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn output_never_grows() {
        let inputs = [
            "",
            "   ",
            "<p>x</p>",
            "<div class=\"jdgm-widget jdgm-all-reviews-widget\">\n\n<p> a </p>\n</div>",
            "<<<>>>",
            "<svg/>text",
            "<<script>x</script>script>alert(1)",
            "<<svg></svg>svg onload=1>",
            "<<!-- c -->style>",
            "<<link rel=a>link href=b>",
            "<scr<script>ipt>",
            "<<<ScRiPt>",
            "<p title='<'>x</p><</style>style>",
        ];
        for input in inputs {
            let out = sanitize(input);
            assert!(out.html.len() <= input.len(), "{:?} grew", input);
            assert_clean(&out.html);
        }
    }
}
