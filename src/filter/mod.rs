// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Cross-chunk tag suppression.
//
// Suppresses text delimited by any of a configured set of XML-like tag
// names (e.g. `xaiartifact`), including opens and closes that straddle
// upstream token boundaries. The filter is single-owner and stateful:
// one instance per response stream.
//
// Closing detection is substring-based (`/>` suffix, `</name>`
// containment). An attribute value containing `>` can therefore end a
// tag region early; accepted limitation.

/// Streaming filter over one token sequence.
///
/// At most one of `in_tag` and a non-empty `pending` holds at a time:
/// bytes are either known tag bytes (suppressed), possibly tag bytes
/// (withheld until disambiguated), or content (emitted).
#[derive(Debug, Clone)]
pub struct TagFilter {
    /// Full open-tag prefixes, one per configured name: `"<" + name`.
    open_prefixes: Vec<String>,
    /// Close-tag markers, one per configured name: `"</" + name + ">"`.
    close_markers: Vec<String>,
    in_tag: bool,
    tag_buf: String,
    pending: String,
}

impl TagFilter {
    pub fn new<I, S>(tag_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = tag_names
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            open_prefixes: names.iter().map(|n| format!("<{n}")).collect(),
            close_markers: names.iter().map(|n| format!("</{n}>")).collect(),
            in_tag: false,
            tag_buf: String::new(),
            pending: String::new(),
        }
    }

    /// Consume one upstream token, returning the emittable text.
    ///
    /// With no configured tags this is the identity function.
    pub fn filter(&mut self, token: &str) -> String {
        if self.open_prefixes.is_empty() {
            return token.to_string();
        }

        let mut out = String::new();
        for c in token.chars() {
            if self.in_tag {
                self.tag_buf.push(c);
                if c == '>' && self.tag_closed() {
                    self.in_tag = false;
                    self.tag_buf.clear();
                }
            } else if !self.pending.is_empty() || c == '<' {
                self.pending.push(c);
                self.resolve_pending(&mut out);
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Stream end: release any prefix still awaiting disambiguation.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// Clear all state for reuse.
    pub fn reset(&mut self) {
        self.in_tag = false;
        self.tag_buf.clear();
        self.pending.clear();
    }

    /// After extending `pending`, decide: committed to a tag, still
    /// ambiguous, or plain content to emit verbatim.
    fn resolve_pending(&mut self, out: &mut String) {
        let pending = &self.pending;

        if self
            .open_prefixes
            .iter()
            .any(|p| pending.len() >= p.len() && pending.starts_with(p.as_str()))
        {
            self.tag_buf = std::mem::take(&mut self.pending);
            self.in_tag = true;
            return;
        }

        // Some configured prefix still extends what we have seen.
        if self
            .open_prefixes
            .iter()
            .any(|p| p.len() > pending.len() && p.starts_with(pending.as_str()))
        {
            return;
        }

        out.push_str(&std::mem::take(&mut self.pending));
    }

    /// Whether `tag_buf` ends the suppressed region: a self-close or a
    /// matching close tag for any configured name.
    fn tag_closed(&self) -> bool {
        if self.tag_buf.ends_with("/>") {
            return true;
        }
        self.close_markers
            .iter()
            .any(|m| self.tag_buf.contains(m.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn run(filter: &mut TagFilter, tokens: &[&str]) -> String {
        let mut out = String::new();
        for t in tokens {
            out.push_str(&filter.filter(t));
        }
        out.push_str(&filter.flush());
        out
    }

    // ---------------------------------------------------------------
    // 1. No configured tags -> identity
    // ---------------------------------------------------------------

    #[test]
    fn no_tags_is_identity() {
        let mut f = TagFilter::new(Vec::<String>::new());
        assert_eq!(f.filter("a < b > c </x>"), "a < b > c </x>");
        assert_eq!(f.flush(), "");
    }

    // ---------------------------------------------------------------
    // 2. Whole tag in one token suppressed
    // ---------------------------------------------------------------

    #[test]
    fn single_token_tag_suppressed() {
        let mut f = TagFilter::new(["xaiartifact"]);
        assert_eq!(
            run(&mut f, &["before <xaiartifact>hidden</xaiartifact> after"]),
            "before  after"
        );
    }

    // ---------------------------------------------------------------
    // 3. Open tag straddling token boundaries
    // ---------------------------------------------------------------

    #[test]
    fn cross_chunk_open_tag_suppressed() {
        let mut f = TagFilter::new(["xaiartifact"]);
        assert_eq!(
            run(&mut f, &["Hello <xai", "artifact>secret</xaiartifact> World"]),
            "Hello  World"
        );
    }

    #[test]
    fn close_tag_straddles_tokens() {
        let mut f = TagFilter::new(["xaiartifact"]);
        assert_eq!(
            run(
                &mut f,
                &["<xaiartifact>s", "ecret</xai", "artifact>done"]
            ),
            "done"
        );
    }

    #[test]
    fn single_char_tokens() {
        let mut f = TagFilter::new(["ab"]);
        let tokens: Vec<String> = "x<ab>y</ab>z".chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
        assert_eq!(run(&mut f, &refs), "xz");
    }

    // ---------------------------------------------------------------
    // 4. Ambiguous prefix that turns out to be content
    // ---------------------------------------------------------------

    #[test]
    fn false_prefix_is_emitted_verbatim() {
        let mut f = TagFilter::new(["xaiartifact"]);
        assert_eq!(run(&mut f, &["a <xab> b"]), "a <xab> b");
    }

    #[test]
    fn lone_angle_bracket_before_non_tag_char() {
        let mut f = TagFilter::new(["xaiartifact"]);
        assert_eq!(run(&mut f, &["1 < 2"]), "1 < 2");
    }

    #[test]
    fn pending_prefix_released_on_flush() {
        let mut f = TagFilter::new(["xaiartifact"]);
        let mut out = f.filter("tail <xai");
        out.push_str(&f.flush());
        assert_eq!(out, "tail <xai");
    }

    // ---------------------------------------------------------------
    // 5. Self-closing and namespaced tags
    // ---------------------------------------------------------------

    #[test]
    fn self_closing_tag_suppressed() {
        let mut f = TagFilter::new(["xaiartifact"]);
        assert_eq!(run(&mut f, &["a<xaiartifact id=\"1\"/>b"]), "ab");
    }

    #[test]
    fn namespaced_tag_name() {
        let mut f = TagFilter::new(["xai:tool_usage_card"]);
        assert_eq!(
            run(
                &mut f,
                &["x <xai:tool_usage_card>body</xai:tool_usage_card> y"]
            ),
            "x  y"
        );
    }

    #[test]
    fn tag_with_attributes_suppressed_until_close() {
        let mut f = TagFilter::new(["xaiartifact"]);
        assert_eq!(
            run(
                &mut f,
                &["<xaiartifact lang=\"rust\" title=\"x\">fn main() {}</xaiartifact>ok"]
            ),
            "ok"
        );
    }

    // ---------------------------------------------------------------
    // 6. Multiple configured tags
    // ---------------------------------------------------------------

    #[test]
    fn multiple_tags_both_suppressed() {
        let mut f = TagFilter::new(["xaiartifact", "xai:tool_usage_card"]);
        assert_eq!(
            run(
                &mut f,
                &["a<xaiartifact>1</xaiartifact>b<xai:tool_usage_card>2</xai:tool_usage_card>c"]
            ),
            "abc"
        );
    }

    // ---------------------------------------------------------------
    // 7. State discipline
    // ---------------------------------------------------------------

    #[test]
    fn reset_clears_mid_tag_state() {
        let mut f = TagFilter::new(["xaiartifact"]);
        f.filter("<xaiartifact>partial");
        f.reset();
        assert_eq!(f.filter("clean"), "clean");
    }

    #[test]
    fn never_emits_partial_tag_bytes() {
        let mut f = TagFilter::new(["xaiartifact"]);
        // Every emitted fragment must be free of suppressed-tag bytes
        // even while the open tag arrives one char at a time.
        let mut out = String::new();
        for t in ["<", "x", "a", "i", "a", "r", "t", "i", "f", "a", "c", "t", ">"] {
            out.push_str(&f.filter(t));
        }
        assert_eq!(out, "");
    }
}
