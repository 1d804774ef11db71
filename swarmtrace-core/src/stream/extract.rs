//! Marker extraction from agent text
//!
//! Older backends do not emit structured tool/handoff chunks; instead the
//! agents' text carries glyph-prefixed markers:
//!
//! ```text
//! 🔧 **Tool Called:** `read_file`
//! **Purpose:** check the config
//! **Target File:** `config.toml`
//! ✅ **File Found:** `config.toml`
//!
//! ✅ **File Written Successfully:** `out.txt`
//! **Size:** 120 bytes
//! **Lines:** 4
//!
//! 🤝 Handoff: Researcher → Writer
//! ✍️ **Writing file:** `draft.md`
//! ⏳ Reading...
//! ```
//!
//! [`MarkerExtractor`] scans for these with ordered regex passes. The
//! vocabulary is unversioned, so anything that does not match exactly is
//! ignored rather than reported as an error.
//!
//! # Sections
//!
//! A tool-call section runs from one `🔧 **Tool Called:**` marker to the
//! next (or the end of the text). The call gets an outcome only when a ✅ or
//! ❌ glyph appears inside its own section; otherwise it stays open. Closing
//! open calls is the caller's job once the run reports `done`.

use crate::types::{FileOperation, ProgressActivity, TargetKind, ToolTarget};
use regex::Regex;

/// Default number of trailing characters scanned per call.
pub const DEFAULT_SCAN_WINDOW: usize = 50_000;

/// Source of activity records derived from an agent's accumulated text.
///
/// Structured chunks make this unnecessary for new backends; implementations
/// exist to keep marker-only backends working.
pub trait ActivityExtractor: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Scan `text` written by `agent` and return every activity found, in
    /// text order. Offsets are byte positions in `text`.
    fn extract(&self, agent: &str, text: &str) -> Vec<Activity>;
}

/// One marker match
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub agent: String,
    /// Byte offset of the marker within the scanned text
    pub offset: usize,
    /// No later text can change this match: a blank line or another
    /// marker follows it
    pub settled: bool,
    pub kind: ActivityKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActivityKind {
    ToolCall(ToolCallMatch),
    FileResult(FileResultMatch),
    Handoff(HandoffMatch),
    Progress(ProgressMatch),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallMatch {
    pub tool: String,
    pub purpose: Option<String>,
    pub target: Option<ToolTarget>,
    /// Present when a status glyph closed the section
    pub outcome: Option<ToolOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    /// Section text from the status glyph to the end of the section
    pub output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileResultMatch {
    pub operation: FileOperation,
    pub path: String,
    pub size_bytes: Option<u64>,
    pub lines: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandoffMatch {
    pub from: String,
    pub to: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressMatch {
    pub activity: ProgressActivity,
    pub path: Option<String>,
}

/// Regex-driven scanner for the marker vocabulary.
pub struct MarkerExtractor {
    window: usize,
    tool_call: Regex,
    purpose: Regex,
    target: Regex,
    file_result: Regex,
    size: Regex,
    lines: Regex,
    handoff: Regex,
    reason: Regex,
    writing: Regex,
    reading: Regex,
}

impl MarkerExtractor {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_SCAN_WINDOW)
    }

    /// Create an extractor that only scans the trailing `window` characters.
    pub fn with_window(window: usize) -> Self {
        Self {
            window: window.max(1),
            tool_call: Regex::new(r"🔧[ \t]*\*\*Tool Called:\*\*[ \t]*`([^`\n]+)`")
                .expect("valid regex"),
            purpose: Regex::new(r"\*\*Purpose:\*\*[ \t]*([^\n]+)").expect("valid regex"),
            target: Regex::new(r"\*\*Target (File|Directory):\*\*[ \t]*`([^`\n]+)`")
                .expect("valid regex"),
            file_result: Regex::new(
                r"(✅|❌)[ \t]*\*\*(File Found|File Not Found|File Written Successfully):\*\*[ \t]*`([^`\n]+)`",
            )
            .expect("valid regex"),
            size: Regex::new(r"\*\*Size:\*\*[ \t]*([\d,]+)[ \t]*bytes").expect("valid regex"),
            lines: Regex::new(r"\*\*Lines:\*\*[ \t]*([\d,]+)").expect("valid regex"),
            handoff: Regex::new(
                r"(?m)🤝[ \t]*Handoff:[ \t]*([^\n→]+?)[ \t]*→[ \t]*([^\n(]+?)[ \t]*(?:\(([^)\n]*)\))?[ \t]*$",
            )
            .expect("valid regex"),
            reason: Regex::new(r"\A[ \t]*\r?\n[ \t]*\*\*Reason:\*\*[ \t]*([^\n]+)")
                .expect("valid regex"),
            writing: Regex::new(r"✍\x{FE0F}?[ \t]*\*\*Writing file:\*\*[ \t]*`([^`\n]+)`")
                .expect("valid regex"),
            reading: Regex::new(r"⏳[ \t]*Reading\.\.\.").expect("valid regex"),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    fn scan_tool_calls(&self, agent: &str, base: usize, text: &str, out: &mut Vec<Activity>) {
        let starts: Vec<_> = self.tool_call.captures_iter(text).collect();

        for (i, caps) in starts.iter().enumerate() {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let section_end = starts
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map(|m| m.start())
                .unwrap_or(text.len());
            let section = &text[whole.end()..section_end];

            let purpose = self
                .purpose
                .captures(section)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|p| !p.is_empty());

            let target = self.target.captures(section).and_then(|c| {
                let kind = match c.get(1)?.as_str() {
                    "Directory" => TargetKind::Directory,
                    _ => TargetKind::File,
                };
                Some(ToolTarget {
                    kind,
                    path: c.get(2)?.as_str().trim().to_string(),
                })
            });

            let outcome = section
                .find(|c: char| c == '✅' || c == '❌')
                .map(|pos| ToolOutcome {
                    success: section[pos..].starts_with('✅'),
                    output: section[pos..].trim().to_string(),
                });

            out.push(Activity {
                agent: agent.to_string(),
                offset: base + whole.start(),
                settled: false,
                kind: ActivityKind::ToolCall(ToolCallMatch {
                    tool: name.as_str().trim().to_string(),
                    purpose,
                    target,
                    outcome,
                }),
            });
        }
    }

    fn scan_file_results(&self, agent: &str, base: usize, text: &str, out: &mut Vec<Activity>) {
        // Size/Lines belong to a file marker only up to the next marker of either kind
        let mut boundaries: Vec<usize> = self
            .tool_call
            .find_iter(text)
            .chain(self.file_result.find_iter(text))
            .map(|m| m.start())
            .collect();
        boundaries.sort_unstable();

        for caps in self.file_result.captures_iter(text) {
            let (Some(whole), Some(label), Some(path)) = (caps.get(0), caps.get(2), caps.get(3))
            else {
                continue;
            };
            let operation = match label.as_str() {
                "File Found" => FileOperation::Found,
                "File Not Found" => FileOperation::NotFound,
                _ => FileOperation::Written,
            };

            let tail_end = boundaries
                .iter()
                .copied()
                .find(|&b| b > whole.start())
                .unwrap_or(text.len());
            let tail = &text[whole.end()..tail_end];

            out.push(Activity {
                agent: agent.to_string(),
                offset: base + whole.start(),
                settled: false,
                kind: ActivityKind::FileResult(FileResultMatch {
                    operation,
                    path: path.as_str().trim().to_string(),
                    size_bytes: capture_number(&self.size, tail),
                    lines: capture_number(&self.lines, tail),
                }),
            });
        }
    }

    fn scan_handoffs(&self, agent: &str, base: usize, text: &str, out: &mut Vec<Activity>) {
        for caps in self.handoff.captures_iter(text) {
            let (Some(whole), Some(from), Some(to)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let from = clean_name(from.as_str());
            let to = clean_name(to.as_str());
            if from.is_empty() || to.is_empty() {
                continue;
            }

            let reason = caps
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .or_else(|| {
                    self.reason
                        .captures(&text[whole.end()..])
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().trim().to_string())
                })
                .filter(|r| !r.is_empty());

            out.push(Activity {
                agent: agent.to_string(),
                offset: base + whole.start(),
                settled: false,
                kind: ActivityKind::Handoff(HandoffMatch { from, to, reason }),
            });
        }
    }

    fn scan_progress(&self, agent: &str, base: usize, text: &str, out: &mut Vec<Activity>) {
        for caps in self.writing.captures_iter(text) {
            let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push(Activity {
                agent: agent.to_string(),
                offset: base + whole.start(),
                settled: false,
                kind: ActivityKind::Progress(ProgressMatch {
                    activity: ProgressActivity::Writing,
                    path: Some(path.as_str().trim().to_string()),
                }),
            });
        }
        for m in self.reading.find_iter(text) {
            out.push(Activity {
                agent: agent.to_string(),
                offset: base + m.start(),
                settled: false,
                kind: ActivityKind::Progress(ProgressMatch {
                    activity: ProgressActivity::Reading,
                    path: None,
                }),
            });
        }
    }
}

impl Default for MarkerExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityExtractor for MarkerExtractor {
    fn name(&self) -> &'static str {
        "markers"
    }

    fn extract(&self, agent: &str, text: &str) -> Vec<Activity> {
        let base = window_start(text, self.window);
        let scanned = &text[base..];
        if base > 0 {
            tracing::trace!(
                agent,
                skipped_bytes = base,
                "Scanning trailing window of oversized text"
            );
        }

        let mut out = Vec::new();
        self.scan_tool_calls(agent, base, scanned, &mut out);
        self.scan_file_results(agent, base, scanned, &mut out);
        self.scan_handoffs(agent, base, scanned, &mut out);
        self.scan_progress(agent, base, scanned, &mut out);

        // Passes run in a fixed order; report in text order
        out.sort_by_key(|a| a.offset);

        let offsets: Vec<usize> = out.iter().map(|a| a.offset).collect();
        for (i, activity) in out.iter_mut().enumerate() {
            let later_marker = offsets[i + 1..].iter().any(|&o| o > activity.offset);
            activity.settled =
                later_marker || scanned[activity.offset - base..].contains("\n\n");
        }
        out
    }
}

/// Byte index where the trailing `window` characters of `text` begin.
pub fn window_start(text: &str, window: usize) -> usize {
    if text.len() <= window {
        return 0;
    }
    text.char_indices()
        .rev()
        .nth(window - 1)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn capture_number(re: &Regex, text: &str) -> Option<u64> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().replace(',', "").parse().ok())
}

/// Strip markdown emphasis and whitespace around an agent name.
fn clean_name(raw: &str) -> String {
    raw.trim().trim_matches('*').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn extract(text: &str) -> Vec<Activity> {
        MarkerExtractor::new().extract("Researcher", text)
    }

    #[test]
    fn test_tool_call_and_file_write() {
        let text = "Let me look.\n\
                    🔧 **Tool Called:** `search`\n\
                    **Purpose:** find sources\n\
                    Working...\n\
                    ✅ **File Written Successfully:** `out.txt`\n\
                    **Size:** 120 bytes\n\
                    **Lines:** 4\n";
        let activities = extract(text);

        let tools: Vec<_> = activities
            .iter()
            .filter_map(|a| match &a.kind {
                ActivityKind::ToolCall(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool, "search");
        assert_eq!(tools[0].purpose.as_deref(), Some("find sources"));
        assert!(tools[0].outcome.as_ref().unwrap().success);

        let files: Vec<_> = activities
            .iter()
            .filter_map(|a| match &a.kind {
                ActivityKind::FileResult(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].operation, FileOperation::Written);
        assert_eq!(files[0].path, "out.txt");
        assert_eq!(files[0].size_bytes, Some(120));
        assert_eq!(files[0].lines, Some(4));
    }

    #[test]
    fn test_handoff() {
        let activities = extract("Done here.\n🤝 Handoff: Researcher → Writer\n");
        assert_eq!(activities.len(), 1);
        assert_eq!(
            activities[0].kind,
            ActivityKind::Handoff(HandoffMatch {
                from: "Researcher".to_string(),
                to: "Writer".to_string(),
                reason: None,
            })
        );
    }

    #[test]
    fn test_handoff_reasons() {
        let inline = extract("🤝 Handoff: **Researcher** → **Writer** (draft ready)");
        assert!(matches!(
            &inline[0].kind,
            ActivityKind::Handoff(h) if h.from == "Researcher" && h.to == "Writer"
                && h.reason.as_deref() == Some("draft ready")
        ));

        let next_line = extract("🤝 Handoff: Writer → Editor\n**Reason:** needs review\n");
        assert!(matches!(
            &next_line[0].kind,
            ActivityKind::Handoff(h) if h.reason.as_deref() == Some("needs review")
        ));
    }

    #[test]
    fn test_outcome_only_within_own_section() {
        let text = "🔧 **Tool Called:** `read_file`\n\
                    **Target File:** `a.txt`\n\
                    🔧 **Tool Called:** `list_dir`\n\
                    **Target Directory:** `src`\n\
                    ❌ **File Not Found:** `src`\n";
        let tools: Vec<_> = extract(text)
            .into_iter()
            .filter_map(|a| match a.kind {
                ActivityKind::ToolCall(t) => Some(t),
                _ => None,
            })
            .collect();

        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].tool, "read_file");
        assert_eq!(tools[0].outcome, None);
        assert_eq!(
            tools[0].target,
            Some(ToolTarget {
                kind: TargetKind::File,
                path: "a.txt".to_string()
            })
        );

        assert_eq!(tools[1].tool, "list_dir");
        let outcome = tools[1].outcome.as_ref().unwrap();
        assert!(!outcome.success);
        assert!(outcome.output.contains("File Not Found"));
        assert_eq!(tools[1].target.as_ref().unwrap().kind, TargetKind::Directory);
    }

    #[test]
    fn test_size_not_borrowed_from_later_marker() {
        let text = "✅ **File Found:** `a.txt`\n\
                    ✅ **File Written Successfully:** `b.txt`\n\
                    **Size:** 1,024 bytes\n";
        let files: Vec<_> = extract(text)
            .into_iter()
            .filter_map(|a| match a.kind {
                ActivityKind::FileResult(f) => Some(f),
                _ => None,
            })
            .collect();

        assert_eq!(files[0].operation, FileOperation::Found);
        assert_eq!(files[0].size_bytes, None);
        assert_eq!(files[1].size_bytes, Some(1024));
        assert_eq!(files[1].lines, None);
    }

    #[test]
    fn test_progress_markers() {
        let activities = extract("✍️ **Writing file:** `draft.md`\n⏳ Reading...\n");
        assert_eq!(activities.len(), 2);
        assert_eq!(
            activities[0].kind,
            ActivityKind::Progress(ProgressMatch {
                activity: ProgressActivity::Writing,
                path: Some("draft.md".to_string()),
            })
        );
        assert_eq!(
            activities[1].kind,
            ActivityKind::Progress(ProgressMatch {
                activity: ProgressActivity::Reading,
                path: None,
            })
        );
    }

    #[test]
    fn test_malformed_markers_ignored() {
        let activities = extract(
            "🔧 Tool Called: search\n✅ File Written: out.txt\n🤝 Handoff: Researcher\n",
        );
        assert!(activities.is_empty());
    }

    #[test]
    fn test_results_in_text_order() {
        let text = "🤝 Handoff: A → B\n🔧 **Tool Called:** `x`\n⏳ Reading...\n";
        let offsets: Vec<_> = extract(text).iter().map(|a| a.offset).collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        assert_eq!(offsets, sorted);
        assert_eq!(offsets.len(), 3);
    }

    #[test]
    fn test_window_truncation_keeps_offsets_absolute() {
        let extractor = MarkerExtractor::with_window(100);
        let padding = "é".repeat(500);
        let text = format!("🔧 **Tool Called:** `old`\n{padding}🤝 Handoff: A → B\n");

        let activities = extractor.extract("A", &text);
        assert_eq!(activities.len(), 1);
        assert!(matches!(activities[0].kind, ActivityKind::Handoff(_)));
        assert_eq!(&text[activities[0].offset..activities[0].offset + 4], "🤝");
    }

    #[test]
    fn test_trailing_marker_unsettled_until_block_ends() {
        let partial = "🔧 **Tool Called:** `read_file`\n";
        assert!(!extract(partial)[0].settled);

        let with_target = "🔧 **Tool Called:** `read_file`\n**Target File:** `a.md`\n\n";
        assert!(extract(with_target)[0].settled);

        let followed = "🤝 Handoff: A → B\n🤝 Handoff: B → C";
        let activities = extract(followed);
        assert!(activities[0].settled);
        assert!(!activities[1].settled);
    }

    #[test]
    fn test_window_start_char_boundary() {
        assert_eq!(window_start("short", 10), 0);
        let text = "aé€😀";
        let start = window_start(text, 2);
        assert_eq!(&text[start..], "€😀");
    }
}
