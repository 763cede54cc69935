//! Marker-delimited block sections inside a shared hosts-style text file
//!
//! Every managed region looks like:
//!
//! ```text
//! # >>> CURFEW-YOUTUBE-START <<<
//! # curfew - YouTube block
//! 127.0.0.1 youtube.com
//! # >>> CURFEW-YOUTUBE-END <<<
//! ```
//!
//! This module is pure text manipulation; the hosts manager owns the I/O.
//!
//! # Corruption policy
//!
//! A start marker without a matching end marker (manual edits, truncated
//! writes) never causes data loss: the orphaned start marker is dropped and
//! every buffered line is written back to the output, and the anomaly is
//! reported in [`RemovedSection::anomaly`].

use std::fmt::Write as _;

/// Start/end marker pair for one section tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionMarkers {
    pub start: String,
    pub end: String,
}

impl SectionMarkers {
    /// Builds `# >>> <NAMESPACE>-<TAG>-START <<<` / `...-END <<<`.
    pub fn new(namespace: &str, tag: &str) -> Self {
        Self {
            start: format!("# >>> {namespace}-{tag}-START <<<"),
            end: format!("# >>> {namespace}-{tag}-END <<<"),
        }
    }

    /// True iff both markers appear somewhere in `text`.
    pub fn present_in(&self, text: &str) -> bool {
        text.contains(&self.start) && text.contains(&self.end)
    }
}

/// Something unexpected found while stripping a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionAnomaly {
    /// The end marker was missing; `recovered_lines` lines were kept.
    MissingEndMarker { recovered_lines: usize },
}

/// Output of [`remove_section`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSection {
    pub text: String,
    /// Lines removed, markers included.
    pub removed_lines: usize,
    pub anomaly: Option<SectionAnomaly>,
}

/// Line terminator used by an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn detect(text: &str) -> Self {
        if text.contains("\r\n") {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

/// Removes every section delimited by `markers` from `text`.
///
/// Lines outside any section pass through byte-for-byte. The single blank
/// separator line that [`append_section`] places before a section is removed
/// along with it. Duplicate sections (the same tag twice) are all removed.
pub fn remove_section(text: &str, markers: &SectionMarkers) -> RemovedSection {
    let mut out = String::with_capacity(text.len());
    let mut removed_lines = 0;
    let mut anomaly = None;

    // Blank line held back in case it turns out to be our separator
    let mut pending_blank: Option<&str> = None;
    // Lines of a section that has started but not yet ended
    let mut buffered: Option<Vec<&str>> = None;
    let mut separator_for_buffer: Option<&str> = None;

    for line in text.split_inclusive('\n') {
        if let Some(buf) = buffered.as_mut() {
            if line.contains(&markers.end) {
                removed_lines += buf.len() + 1;
                buffered = None;
                separator_for_buffer = None;
            } else {
                // A second start before an end folds the earlier section into this one
                buf.push(line);
            }
            continue;
        }

        if line.contains(&markers.start) {
            separator_for_buffer = pending_blank.take();
            buffered = Some(vec![line]);
            continue;
        }

        if let Some(blank) = pending_blank.take() {
            out.push_str(blank);
        }
        if is_blank(line) {
            pending_blank = Some(line);
        } else {
            out.push_str(line);
        }
    }

    if let Some(blank) = pending_blank.take() {
        out.push_str(blank);
    }

    if let Some(buf) = buffered {
        // Unterminated section: keep everything except the orphaned start marker(s)
        if let Some(blank) = separator_for_buffer {
            out.push_str(blank);
        }
        let mut recovered = 0;
        for line in buf {
            if line.contains(&markers.start) {
                removed_lines += 1;
                continue;
            }
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(line);
            recovered += 1;
        }
        anomaly = Some(SectionAnomaly::MissingEndMarker {
            recovered_lines: recovered,
        });
    }

    RemovedSection {
        text: out,
        removed_lines,
        anomaly,
    }
}

/// Renders a complete section: start marker, header comments, one
/// `<redirect> <domain>` line per entry, end marker.
pub fn render_section(
    markers: &SectionMarkers,
    header: &[String],
    redirect: &str,
    domains: &[String],
    eol: LineEnding,
) -> String {
    let eol = eol.as_str();
    let mut out = String::with_capacity(64 + domains.len() * 32);
    out.push_str(&markers.start);
    out.push_str(eol);
    for comment in header {
        let _ = write!(out, "# {comment}{eol}");
    }
    for domain in domains {
        let _ = write!(out, "{redirect} {domain}{eol}");
    }
    out.push_str(&markers.end);
    out.push_str(eol);
    out
}

/// Appends `section` after the existing content, separated by exactly one
/// blank line. Trailing blank lines of `base` are collapsed.
pub fn append_section(base: &str, section: &str, eol: LineEnding) -> String {
    let trimmed = base.trim_end_matches(['\n', '\r']);
    if trimmed.trim().is_empty() {
        return section.to_string();
    }
    let eol = eol.as_str();
    let mut out = String::with_capacity(trimmed.len() + section.len() + 4);
    out.push_str(trimmed);
    out.push_str(eol);
    out.push_str(eol);
    out.push_str(section);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn markers() -> SectionMarkers {
        SectionMarkers::new("CURFEW", "YOUTUBE")
    }

    fn domains(list: &[&str]) -> Vec<String> {
        list.iter().map(|d| (*d).to_string()).collect()
    }

    fn block(text: &str, list: &[&str]) -> String {
        let m = markers();
        let cleaned = remove_section(text, &m).text;
        let section = render_section(
            &m,
            &["curfew - YouTube block".to_string()],
            "127.0.0.1",
            &domains(list),
            LineEnding::detect(text),
        );
        append_section(&cleaned, &section, LineEnding::detect(text))
    }

    const BASE: &str = "127.0.0.1 localhost\n::1 localhost\n";

    #[test]
    fn test_markers_format() {
        let m = markers();
        assert_eq!(m.start, "# >>> CURFEW-YOUTUBE-START <<<");
        assert_eq!(m.end, "# >>> CURFEW-YOUTUBE-END <<<");
    }

    #[test]
    fn test_render_section_layout() {
        let m = markers();
        let section = render_section(
            &m,
            &["header".to_string()],
            "127.0.0.1",
            &domains(&["youtube.com", "youtu.be"]),
            LineEnding::Lf,
        );
        assert_eq!(
            section,
            "# >>> CURFEW-YOUTUBE-START <<<\n# header\n127.0.0.1 youtube.com\n127.0.0.1 youtu.be\n# >>> CURFEW-YOUTUBE-END <<<\n"
        );
    }

    #[test]
    fn test_append_uses_single_blank_separator() {
        let blocked = block(BASE, &["youtube.com"]);
        assert!(blocked.starts_with("127.0.0.1 localhost\n::1 localhost\n\n# >>> CURFEW"));
        assert!(!blocked.contains("\n\n\n"));
    }

    #[test]
    fn test_block_twice_yields_one_section() {
        let once = block(BASE, &["youtube.com"]);
        let twice = block(&once, &["youtube.com"]);
        assert_eq!(once, twice);
        assert_eq!(twice.matches(&markers().start).count(), 1);
    }

    #[test]
    fn test_remove_restores_original() {
        let blocked = block(BASE, &["youtube.com", "m.youtube.com"]);
        let removed = remove_section(&blocked, &markers());
        assert_eq!(removed.text, BASE);
        assert_eq!(removed.removed_lines, 5);
        assert!(removed.anomaly.is_none());
    }

    #[test]
    fn test_remove_keeps_content_after_section() {
        let blocked = block(BASE, &["youtube.com"]);
        let with_tail = format!("{blocked}10.0.0.5 nas.lan\n");
        let removed = remove_section(&with_tail, &markers());
        assert_eq!(removed.text, format!("{BASE}10.0.0.5 nas.lan\n"));
    }

    #[test]
    fn test_remove_ignores_other_tags() {
        let other = SectionMarkers::new("CURFEW", "INSTAGRAM");
        let section = render_section(
            &other,
            &[],
            "127.0.0.1",
            &domains(&["instagram.com"]),
            LineEnding::Lf,
        );
        let text = append_section(BASE, &section, LineEnding::Lf);
        let removed = remove_section(&text, &markers());
        assert_eq!(removed.text, text);
        assert_eq!(removed.removed_lines, 0);
    }

    #[test]
    fn test_missing_end_marker_recovers_lines() {
        let text = format!(
            "{BASE}\n{}\n127.0.0.1 youtube.com\n127.0.0.1 youtu.be\n",
            markers().start
        );
        let removed = remove_section(&text, &markers());
        assert_eq!(
            removed.anomaly,
            Some(SectionAnomaly::MissingEndMarker { recovered_lines: 2 })
        );
        assert!(removed.text.contains("127.0.0.1 youtube.com"));
        assert!(removed.text.contains("127.0.0.1 youtu.be"));
        assert!(!removed.text.contains(&markers().start));
    }

    #[test]
    fn test_recovered_lines_survive_reblock() {
        let text = format!(
            "{BASE}{}\n127.0.0.1 keep.example\n",
            markers().start
        );
        let reblocked = block(&text, &["youtube.com"]);
        let again = block(&reblocked, &["youtube.com"]);
        assert!(again.contains("127.0.0.1 keep.example"));
        assert_eq!(again.matches(&markers().start).count(), 1);
    }

    #[test]
    fn test_crlf_files_keep_crlf() {
        let base = "127.0.0.1 localhost\r\n";
        let blocked = block(base, &["youtube.com"]);
        assert!(blocked.contains("127.0.0.1 youtube.com\r\n"));
        assert_eq!(remove_section(&blocked, &markers()).text, base);
    }

    #[test]
    fn test_present_in_requires_both_markers() {
        let m = markers();
        assert!(!m.present_in(&format!("{}\n", m.start)));
        assert!(m.present_in(&block(BASE, &["youtube.com"])));
    }

    fn host_line() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z]{1,12}\\.(com|lan|org)".prop_map(|d| format!("10.0.0.1 {d}")),
            "# [a-z ]{0,20}",
            Just(String::new()),
        ]
    }

    fn host_file() -> impl Strategy<Value = String> {
        prop::collection::vec(host_line(), 0..20).prop_map(|lines| {
            let mut text = lines.join("\n");
            let trimmed = text.trim_end().len();
            text.truncate(trimmed);
            if !text.is_empty() {
                text.push('\n');
            }
            text
        })
    }

    proptest! {
        #[test]
        fn prop_block_is_idempotent(base in host_file()) {
            let once = block(&base, &["youtube.com", "youtu.be"]);
            let twice = block(&once, &["youtube.com", "youtu.be"]);
            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(twice.matches(&markers().start).count(), 1);
        }

        #[test]
        fn prop_block_then_unblock_round_trips(base in host_file()) {
            prop_assume!(!base.trim().is_empty());
            let blocked = block(&base, &["youtube.com"]);
            let removed = remove_section(&blocked, &markers());
            prop_assert_eq!(removed.text, base);
        }

        #[test]
        fn prop_unterminated_section_loses_nothing(
            base in host_file(),
            entries in prop::collection::vec("[a-z]{1,10}\\.com", 1..8),
        ) {
            let mut text = base.clone();
            text.push_str(&markers().start);
            text.push('\n');
            for entry in &entries {
                text.push_str(&format!("127.0.0.1 {entry}\n"));
            }
            let reblocked = block(&text, &["youtube.com"]);
            let again = block(&reblocked, &["youtube.com"]);
            for entry in &entries {
                let needle = format!("127.0.0.1 {entry}");
                prop_assert!(again.contains(&needle));
            }
        }
    }
}
