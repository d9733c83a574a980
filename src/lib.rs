//! Reconciles fuzzy, LLM-produced unified diffs against real file contents.
//!
//! Language models emit unified diffs with unreliable coordinates: line numbers
//! drift, context lines get paraphrased, real lines go missing and commentary
//! lines appear that were never in the source. `diffmend` parses such diffs out
//! of a chat transcript, *corrects* each hunk against the file it claims to
//! modify, and applies the corrected edits. Hunks it cannot rescue are
//! reported as human-readable problems instead of failing the whole patch.
//!
//! ## Getting started
//!
//! The typical flow is a single call to [`reconcile`]: hand it the raw reply
//! text and the current file contents, get back the new contents plus a problem
//! report.
//!
//! ```rust
//! use diffmend::{reconcile, FileContents, ReconcileOptions};
//! use std::path::Path;
//!
//! let chat = [
//!     "Sure, here is the change:",
//!     "```diff",
//!     "--- src/greet.py",
//!     "+++ src/greet.py",
//!     "@@ -1,3 +1,3 @@",
//!     " def greet():",
//!     "-    print(\"hello\")",
//!     "+    print(\"hello, world\")",
//!     " ",
//!     "```",
//! ]
//! .join("\n");
//!
//! let mut files = FileContents::new();
//! files.insert(
//!     "src/greet.py".into(),
//!     "def greet():\n    print(\"hello\")\n".to_string(),
//! );
//!
//! let result = reconcile(&chat, &files, &ReconcileOptions::default());
//! assert!(result.problems.is_empty());
//! assert_eq!(
//!     result.files[Path::new("src/greet.py")],
//!     "def greet():\n    print(\"hello, world\")\n"
//! );
//! ```
//!
//! ## Key concepts
//!
//! - [`parse_diffs`] extracts [`Diff`]s from fenced blocks in arbitrary text,
//!   under a wall-clock time budget.
//! - [`Diff::validate_and_correct`] walks each [`Hunk`] against the real file,
//!   re-anchoring hunks whose stated start line is wrong, splicing back lines
//!   the model skipped and dropping lines it invented. Hunks that cannot be
//!   reconciled are removed from the diff; their problems are kept for the
//!   operator (and for asking the model to resend just those hunks).
//! - [`apply_diffs`] replays the corrected edits over a
//!   [`FileContents`] mapping and returns the new mapping.
//!
//! All fuzzy comparisons go through [`similarity`], a character-multiset
//! overlap ratio that ignores spaces and case. It is deliberately *not* an
//! edit distance: scrambled lines with the same characters score 1.0. That
//! weakness is part of the contract: it tolerates the reflow noise models
//! introduce, and matching behavior depends on it.

use log::{debug, info, trace, warn};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use thiserror::Error;

// --- Constants ---

/// Default threshold above which two lines are considered the same line.
pub const SIMILARITY_THRESHOLD: f64 = 0.9;

/// Number of non-add lines used as a lookahead fingerprint when deciding how
/// to repair a mismatch.
pub const DEFAULT_FORWARD_BLOCK_LEN: usize = 10;

/// Pre-edit filename that marks a diff as creating a brand-new file.
pub const NO_SOURCE_FILE: &str = "/dev/null";

// --- Error Types ---

/// Errors surfaced while extracting diff blocks from raw text.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The time budget for parsing was exhausted. Adversarial or degenerate
    /// input must not be able to stall the caller, so parsing aborts with no
    /// partial result; the caller should treat this as "no proposed changes".
    #[error("diff parsing exceeded its {timeout:?} time budget")]
    Timeout {
        /// The budget that was exceeded.
        timeout: Duration,
    },
}

// --- Similarity Scorer ---

/// Scores how alike two strings are, as a ratio in `[0, 1]`.
///
/// Spaces are stripped, everything is lowercased, and the size of the
/// character-multiset intersection is divided by the length of the longer
/// string. Two strings that are both empty after stripping score 1.0.
///
/// The score is order-insensitive by design; see the crate docs for why.
///
/// ```
/// use diffmend::similarity;
///
/// assert_eq!(similarity("Answer = 42", "answer=42"), 1.0);
/// assert_eq!(similarity("listen", "silent"), 1.0); // anagrams are "similar"
/// assert_eq!(similarity("", ""), 1.0);
/// assert!(similarity("foo", "bar") < 0.5);
/// ```
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    let longer = a.chars().count().max(b.chars().count());
    if longer == 0 {
        return 1.0;
    }
    let mut budget: HashMap<char, usize> = HashMap::new();
    for c in a.chars() {
        *budget.entry(c).or_insert(0) += 1;
    }
    let mut intersection = 0usize;
    for c in b.chars() {
        if let Some(remaining) = budget.get_mut(&c) {
            if *remaining > 0 {
                *remaining -= 1;
                intersection += 1;
            }
        }
    }
    intersection as f64 / longer as f64
}

/// Thresholded form of [`similarity`].
pub fn is_similar(a: &str, b: &str, threshold: f64) -> bool {
    similarity(a, b) >= threshold
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| *c != ' ')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

// --- Data Structures ---

/// The three kinds of line a unified-diff hunk can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    /// Unchanged context (` ` prefix).
    Retain,
    /// Inserted line (`+` prefix).
    Add,
    /// Deleted line (`-` prefix).
    Remove,
}

impl fmt::Display for EditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditKind::Retain => write!(f, "retain"),
            EditKind::Add => write!(f, "add"),
            EditKind::Remove => write!(f, "remove"),
        }
    }
}

/// One line of a hunk: its kind plus the line text (prefix stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEdit {
    pub kind: EditKind,
    pub text: String,
}

impl LineEdit {
    pub fn retain(text: impl Into<String>) -> Self {
        LineEdit {
            kind: EditKind::Retain,
            text: text.into(),
        }
    }

    pub fn add(text: impl Into<String>) -> Self {
        LineEdit {
            kind: EditKind::Add,
            text: text.into(),
        }
    }

    pub fn remove(text: impl Into<String>) -> Self {
        LineEdit {
            kind: EditKind::Remove,
            text: text.into(),
        }
    }
}

/// Running tally of the edit kinds inside a hunk.
///
/// Kept in sync by every mutation primitive on [`Hunk`]; the hunk's corrected
/// pre- and post-edit lengths are recomputed from these after validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditCounts {
    pub retain: usize,
    pub add: usize,
    pub remove: usize,
}

impl EditCounts {
    fn slot(&mut self, kind: EditKind) -> &mut usize {
        match kind {
            EditKind::Retain => &mut self.retain,
            EditKind::Add => &mut self.add,
            EditKind::Remove => &mut self.remove,
        }
    }
}

/// A 1-based line-number to line-text view of one file.
pub type LineMap = BTreeMap<usize, String>;

/// Ordered mapping from file path to full file content.
pub type FileContents = BTreeMap<PathBuf, String>;

/// Converts file content into a 1-based [`LineMap`].
///
/// Splitting is on `'\n'`, so content with a trailing newline produces a final
/// empty entry. Diffs routinely retain that empty last line, and dropping it
/// would break anchor arithmetic.
pub fn content_to_line_map(content: &str) -> LineMap {
    content
        .split('\n')
        .enumerate()
        .map(|(index, text)| (index + 1, text.to_string()))
        .collect()
}

/// Tunables for parsing and reconciliation.
///
/// Everything configurable about the engine lives here and is passed into the
/// operations that need it; there is no process-global state.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    /// Wall-clock budget for [`parse_diffs`].
    pub diff_timeout: Duration,
    /// Threshold for [`is_similar`] during anchoring and line validation.
    pub similarity_threshold: f64,
    /// Upper bound on relabel-and-restart passes per hunk. Comment relabeling
    /// and anchor splicing restart validation from the top; this keeps a
    /// pathological hunk from looping forever.
    pub max_validation_passes: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        ReconcileOptions {
            diff_timeout: Duration::from_secs(3),
            similarity_threshold: SIMILARITY_THRESHOLD,
            max_validation_passes: 32,
        }
    }
}

impl ReconcileOptions {
    /// Creates a new builder for `ReconcileOptions`.
    ///
    /// ```
    /// # use diffmend::ReconcileOptions;
    /// # use std::time::Duration;
    /// let options = ReconcileOptions::builder()
    ///     .diff_timeout(Duration::from_secs(1))
    ///     .similarity_threshold(0.8)
    ///     .build();
    ///
    /// assert_eq!(options.diff_timeout, Duration::from_secs(1));
    /// assert_eq!(options.similarity_threshold, 0.8);
    /// ```
    pub fn builder() -> ReconcileOptionsBuilder {
        ReconcileOptionsBuilder::default()
    }
}

/// A builder for [`ReconcileOptions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptionsBuilder {
    diff_timeout: Option<Duration>,
    similarity_threshold: Option<f64>,
    max_validation_passes: Option<usize>,
}

impl ReconcileOptionsBuilder {
    /// Sets the wall-clock budget for [`parse_diffs`].
    pub fn diff_timeout(mut self, timeout: Duration) -> Self {
        self.diff_timeout = Some(timeout);
        self
    }

    /// Sets the similarity threshold used during validation.
    pub fn similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    /// Sets the per-hunk restart budget.
    pub fn max_validation_passes(mut self, passes: usize) -> Self {
        self.max_validation_passes = Some(passes);
        self
    }

    /// Builds the `ReconcileOptions`.
    pub fn build(self) -> ReconcileOptions {
        let default = ReconcileOptions::default();
        ReconcileOptions {
            diff_timeout: self.diff_timeout.unwrap_or(default.diff_timeout),
            similarity_threshold: self
                .similarity_threshold
                .unwrap_or(default.similarity_threshold),
            max_validation_passes: self
                .max_validation_passes
                .unwrap_or(default.max_validation_passes),
        }
    }
}

/// Outcome of one anchoring attempt during hunk validation.
enum StartLineOutcome {
    /// `start_line_pre_edit` now points at a trusted anchor.
    Anchored,
    /// The hunk was mutated (a line relabeled or spliced in); validation must
    /// restart from the top.
    Restart,
    /// No anchor exists; a problem was recorded.
    NotFound,
}

/// One contiguous block of line-level changes within a diff.
///
/// Created by the parser from a `@@ ... @@` header plus its line block, then
/// mutated in place during validation: lines are inserted, relabeled or
/// removed, and the start/length fields are recomputed once the hunk is
/// corrected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based line where the hunk claims to start in the pre-edit file.
    pub start_line_pre_edit: usize,
    pub len_pre_edit: usize,
    /// 1-based line where the hunk starts in the post-edit file.
    pub start_line_post_edit: usize,
    pub len_post_edit: usize,
    /// Lookahead window used to disambiguate mismatches.
    pub forward_block_len: usize,
    edits: Vec<LineEdit>,
    counts: EditCounts,
    is_new_file: bool,
}

impl Hunk {
    /// Builds a hunk from its header numbers and ordered edits.
    pub fn new(
        start_line_pre_edit: usize,
        len_pre_edit: usize,
        start_line_post_edit: usize,
        len_post_edit: usize,
        edits: Vec<LineEdit>,
    ) -> Self {
        let mut counts = EditCounts::default();
        for edit in &edits {
            *counts.slot(edit.kind) += 1;
        }
        // A hunk with nothing to retain or remove cannot be anchored to the
        // original file; it is classified once, here, so that corrections made
        // during validation cannot flip it mid-flight.
        let is_new_file = counts.retain == 0 && counts.remove == 0;
        Hunk {
            start_line_pre_edit,
            len_pre_edit,
            start_line_post_edit,
            len_post_edit,
            forward_block_len: DEFAULT_FORWARD_BLOCK_LEN,
            edits,
            counts,
            is_new_file,
        }
    }

    /// The ordered line edits of this hunk.
    pub fn edits(&self) -> &[LineEdit] {
        &self.edits
    }

    /// Current tally of edit kinds.
    pub fn counts(&self) -> EditCounts {
        self.counts
    }

    /// Whether this hunk is pure addition (nothing retained or removed).
    ///
    /// Such a hunk is unfalsifiable and exempt from localization. The flag is
    /// frozen at construction time.
    pub fn is_new_file(&self) -> bool {
        self.is_new_file
    }

    /// Inserts a retained line at `index`.
    pub fn add_retained_line(&mut self, line: impl Into<String>, index: usize) {
        self.edits.insert(index, LineEdit::retain(line));
        self.counts.retain += 1;
    }

    /// Changes the kind of the edit at `index`, adjusting both tallies.
    pub fn relabel_line(&mut self, index: usize, new_kind: EditKind) {
        let old_kind = self.edits[index].kind;
        *self.counts.slot(old_kind) -= 1;
        *self.counts.slot(new_kind) += 1;
        self.edits[index].kind = new_kind;
    }

    /// Deletes the edit at `index`.
    pub fn remove_line(&mut self, index: usize) {
        let edit = self.edits.remove(index);
        let slot = self.counts.slot(edit.kind);
        assert!(*slot > 0, "edit counts out of sync with the edit list");
        *slot -= 1;
    }

    /// Renders the hunk as canonical unified-diff text.
    pub fn render(&self) -> String {
        let mut out = format!(
            "@@ -{},{} +{},{} @@\n",
            self.start_line_pre_edit, self.len_pre_edit, self.start_line_post_edit, self.len_post_edit
        );
        for edit in &self.edits {
            let prefix = match edit.kind {
                EditKind::Retain => ' ',
                EditKind::Add => '+',
                EditKind::Remove => '-',
            };
            out.push(prefix);
            out.push_str(&edit.text);
            out.push('\n');
        }
        out
    }

    /// Newline-joined text of the next `window` non-add edits starting at
    /// `from`. Add edits carry no information about the original file, so they
    /// are excluded from the fingerprint.
    pub fn forward_block(&self, from: usize, window: usize) -> String {
        self.edits
            .iter()
            .skip(from)
            .filter(|edit| edit.kind != EditKind::Add)
            .take(window)
            .map(|edit| edit.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Validates this hunk against the real file, correcting it in place.
    ///
    /// Returns `true` when the hunk (possibly after correction) lines up with
    /// the file. Returns `false` after recording at least one problem; a
    /// failed hunk should be dropped from its diff.
    pub fn validate_and_correct(
        &mut self,
        lines: &LineMap,
        problems: &mut Vec<String>,
        options: &ReconcileOptions,
    ) -> bool {
        if self.edits.is_empty() {
            return true;
        }
        for pass in 0..options.max_validation_passes {
            trace!("validation pass {pass} for hunk starting at {}", self.start_line_pre_edit);
            if self.check_start_line(lines, options) {
                return self.validate_lines(lines, problems, options);
            }
            match self.find_start_line(lines, problems, options) {
                StartLineOutcome::Anchored => return self.validate_lines(lines, problems, options),
                StartLineOutcome::Restart => continue,
                StartLineOutcome::NotFound => return false,
            }
        }
        problems.push(format!(
            "In hunk:\n{}validation gave up after {} correction passes",
            self.render(),
            options.max_validation_passes
        ));
        false
    }

    /// Checks whether the stated start line can be trusted as-is.
    ///
    /// Only a pure-addition hunk short-circuits to trusted. When the stated
    /// line exists, its similarity to the hunk's first line is computed but
    /// the result is discarded and the anchor is always re-derived by
    /// `find_start_line`. Tightening this gate would change which hunks get
    /// relocated, so the no-op comparison is kept as documented behavior.
    fn check_start_line(&self, lines: &LineMap, options: &ReconcileOptions) -> bool {
        if self.is_new_file {
            return true;
        }
        if let Some(actual) = lines.get(&self.start_line_pre_edit) {
            let _advisory = is_similar(&self.edits[0].text, actual, options.similarity_threshold);
        }
        false
    }

    /// Relocates the hunk's anchor when the stated line number is wrong.
    fn find_start_line(
        &mut self,
        lines: &LineMap,
        problems: &mut Vec<String>,
        options: &ReconcileOptions,
    ) -> StartLineOutcome {
        if self.edits[0].kind == EditKind::Add {
            // The model began mid-insertion with no anchor. Anchor one line
            // before the first verifiable (non-add) edit instead.
            if let Some(probe) = self.edits.iter().find(|edit| edit.kind != EditKind::Add) {
                let anchor = lines
                    .iter()
                    .find(|(_, content)| {
                        !probe.text.is_empty()
                            && is_similar(&probe.text, content, options.similarity_threshold)
                    })
                    .map(|(number, _)| number.saturating_sub(1));
                let Some(anchor) = anchor else {
                    problems.push(format!(
                        "In hunk:\n{}cannot find the starting line of the diff",
                        self.render()
                    ));
                    return StartLineOutcome::NotFound;
                };
                self.start_line_pre_edit = anchor;
                return match lines.get(&anchor) {
                    Some(previous) if !previous.is_empty() => {
                        // Splice the real preceding line in as the new leading
                        // context and rewalk the hunk from the top.
                        let previous = previous.clone();
                        self.add_retained_line(previous, 0);
                        StartLineOutcome::Restart
                    }
                    _ => {
                        problems.push(format!(
                            "In hunk:\n{}the starting line of the diff does not exist in the code",
                            self.render()
                        ));
                        StartLineOutcome::NotFound
                    }
                };
            }
            // Only add edits: unreachable for anchoring purposes, fall through
            // to scoring the first line like any other hunk.
        }

        let first = self.edits[0].text.clone();
        let candidates: Vec<usize> = lines
            .iter()
            .filter(|(_, content)| is_similar(&first, content, options.similarity_threshold))
            .map(|(number, _)| *number)
            .collect();
        match candidates.as_slice() {
            [] => {
                if first.contains('#') {
                    // Commentary the model injected rather than original
                    // content; relabel it and restart at the next line.
                    self.relabel_line(0, EditKind::Add);
                    StartLineOutcome::Restart
                } else {
                    problems.push(format!(
                        "In hunk:\n{}the starting line of the diff does not exist in the code",
                        self.render()
                    ));
                    StartLineOutcome::NotFound
                }
            }
            [only] => {
                self.start_line_pre_edit = *only;
                StartLineOutcome::Anchored
            }
            [first_match, ..] => {
                // Known limitation: no lookahead disambiguation here, the
                // first match wins.
                warn!(
                    "multiple candidate start lines for hunk at {}; picking line {}",
                    self.start_line_pre_edit, first_match
                );
                self.start_line_pre_edit = *first_match;
                StartLineOutcome::Anchored
            }
        }
    }

    /// Walks the hunk's edits against the file lines from the resolved anchor,
    /// repairing what it can and recording a problem for what it cannot.
    fn validate_lines(
        &mut self,
        lines: &LineMap,
        problems: &mut Vec<String>,
        options: &ReconcileOptions,
    ) -> bool {
        let mut hunk_ind = 0usize;
        let mut file_ind = self.start_line_pre_edit;
        let last_line = lines.last_key_value().map(|(number, _)| *number).unwrap_or(0);

        while hunk_ind < self.edits.len() && file_ind <= last_line {
            if self.edits[hunk_ind].kind == EditKind::Add {
                // Unverifiable against the original; always accepted.
                hunk_ind += 1;
                continue;
            }
            let Some(file_line) = lines.get(&file_ind) else {
                break;
            };
            if is_similar(&self.edits[hunk_ind].text, file_line, options.similarity_threshold) {
                hunk_ind += 1;
                file_ind += 1;
                continue;
            }

            // Commentary lines get relabeled before any heavier machinery.
            if self.edits[hunk_ind].text.contains('#') {
                self.relabel_line(hunk_ind, EditKind::Add);
                continue;
            }

            // Disambiguate the mismatch by comparing three lookahead
            // fingerprints against the file's forward window.
            let forward_code: String = (file_ind..(file_ind + self.forward_block_len).min(last_line))
                .filter_map(|index| lines.get(&index).map(String::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            let unchanged = similarity(
                &self.forward_block(hunk_ind, self.forward_block_len),
                &forward_code,
            );
            // Case 1: the model skipped a real line. Splicing it in front of
            // the hunk's forward content should improve the fingerprint.
            let with_missing_line = {
                let block = self.forward_block(hunk_ind, self.forward_block_len.saturating_sub(1));
                similarity(&format!("{file_line}\n{block}"), &forward_code)
            };
            // Case 2: the model invented a line that is not in the file.
            let without_spurious_line = similarity(
                &self.forward_block(hunk_ind + 1, self.forward_block_len),
                &forward_code,
            );
            trace!(
                "mismatch at hunk edit {hunk_ind}/file line {file_ind}: \
                 unchanged={unchanged:.3} missing={with_missing_line:.3} spurious={without_spurious_line:.3}"
            );

            if unchanged >= with_missing_line && unchanged >= without_spurious_line {
                problems.push(format!(
                    "In hunk:\n{}there was at least one mismatch that could not be reconciled",
                    self.render()
                ));
                return false;
            } else if with_missing_line >= without_spurious_line {
                // Ties go to the missing-line reading: a skipped line is the
                // more common model failure than an invented one.
                //
                // If the model skipped a block adjacent to add edits we cannot
                // know whether the adds belong before or after the block; they
                // are kept before it.
                let line = file_line.clone();
                self.add_retained_line(line, hunk_ind);
                hunk_ind += 1;
                file_ind += 1;
            } else {
                debug!("dropping spurious hunk line: {}", self.edits[hunk_ind].text);
                self.remove_line(hunk_ind);
            }
        }

        if hunk_ind + 1 < self.edits.len() {
            let remaining = self.edits[hunk_ind..]
                .iter()
                .map(|edit| format!("{}: {}", edit.kind, edit.text))
                .collect::<Vec<_>>()
                .join("\n");
            problems.push(format!(
                "In hunk:\n{}validation stopped before the lines below were validated:\n{remaining}",
                self.render()
            ));
            return false;
        }
        true
    }
}

/// All the hunks for one file pair, in ascending pre-edit line order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    /// Pre-edit filename; [`NO_SOURCE_FILE`] marks a brand-new file.
    pub filename_pre: String,
    /// Post-edit filename; the key under which results are stored.
    pub filename_post: String,
    pub hunks: Vec<Hunk>,
}

impl Diff {
    pub fn new(filename_pre: impl Into<String>, filename_post: impl Into<String>) -> Self {
        Diff {
            filename_pre: filename_pre.into(),
            filename_post: filename_post.into(),
            hunks: Vec::new(),
        }
    }

    /// Whether this diff creates a file rather than editing one.
    pub fn is_new_file(&self) -> bool {
        self.filename_pre == NO_SOURCE_FILE || self.hunks.iter().any(|hunk| hunk.is_new_file())
    }

    /// Renders the diff as unified-diff text (without a surrounding fence).
    pub fn render(&self) -> String {
        let mut out = format!("--- {}\n+++ {}\n", self.filename_pre, self.filename_post);
        for hunk in &self.hunks {
            out.push_str(&hunk.render());
        }
        out.trim().to_string()
    }

    /// Validates and corrects every hunk in order against the real file.
    ///
    /// A shrinking working copy of `lines` is maintained: once a hunk has been
    /// successfully processed, the region it consumed is cropped away so a
    /// later hunk cannot anchor into it. Hunks that fail validation are
    /// removed from the diff; their problems are returned. Lengths and the
    /// post-edit start line are recomputed for the hunks that survive.
    pub fn validate_and_correct(
        &mut self,
        lines: &LineMap,
        options: &ReconcileOptions,
    ) -> Vec<String> {
        let mut problems = Vec::new();
        let mut working = lines.clone();
        // (start_pre, len_pre, start_post, len_post) of the last surviving hunk.
        let mut past: Option<(usize, usize, usize, usize)> = None;

        let hunks = std::mem::take(&mut self.hunks);
        for mut hunk in hunks {
            if let Some((past_start_pre, past_len_pre, _, _)) = past {
                // Never crop past the current hunk's own claimed start, or the
                // anchor could fall out of range.
                let cut = (past_start_pre + past_len_pre).min(hunk.start_line_pre_edit);
                working = working.split_off(&cut);
            }

            let is_valid = hunk.validate_and_correct(&working, &mut problems, options);

            // The corrected edit list is the source of truth for lengths.
            let counts = hunk.counts();
            hunk.len_pre_edit = counts.retain + counts.remove;
            hunk.len_post_edit = counts.retain + counts.add;

            if !is_valid {
                debug!("dropping hunk that failed validation:\n{}", hunk.render());
                continue;
            }

            hunk.start_line_post_edit = match past {
                Some((past_start_pre, past_len_pre, past_start_post, past_len_post)) => {
                    let delta = past_len_post as i64 - past_len_pre as i64
                        + past_start_post as i64
                        - past_start_pre as i64;
                    (hunk.start_line_pre_edit as i64 + delta).max(0) as usize
                }
                None => hunk.start_line_pre_edit,
            };
            past = Some((
                hunk.start_line_pre_edit,
                hunk.len_pre_edit,
                hunk.start_line_post_edit,
                hunk.len_post_edit,
            ));
            self.hunks.push(hunk);
        }
        problems
    }
}

// --- Diff Parser ---

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+),(\d+) \+(\d+),(\d+) @@$").expect("hunk header pattern is valid")
});

/// Extracts [`Diff`]s from fenced blocks anywhere in `content`.
///
/// The input is typically a full chat transcript; anything outside fenced
/// blocks, and any fenced block that does not contain `---`/`+++` headers, is
/// ignored. Parsing runs under the given wall-clock budget and returns
/// [`ParseError::Timeout`] with no partial result when it is exceeded.
///
/// When two blocks propose changes for the same post-edit filename, the first
/// wins and the duplicate is discarded with a warning.
///
/// ```
/// use diffmend::parse_diffs;
/// use std::time::Duration;
///
/// let chat = [
///     "Here is the fix:",
///     "```diff",
///     "--- src/lib.rs",
///     "+++ src/lib.rs",
///     "@@ -1,2 +1,2 @@",
///     " fn answer() -> u32 {",
///     "-    41",
///     "+    42",
///     "```",
/// ]
/// .join("\n");
///
/// let diffs = parse_diffs(&chat, Duration::from_secs(3)).unwrap();
/// assert_eq!(diffs.len(), 1);
/// assert_eq!(diffs[0].filename_post, "src/lib.rs");
/// assert_eq!(diffs[0].hunks.len(), 1);
/// ```
pub fn parse_diffs(content: &str, timeout: Duration) -> Result<Vec<Diff>, ParseError> {
    let deadline = Instant::now() + timeout;
    let mut diffs: Vec<Diff> = Vec::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        if Instant::now() >= deadline {
            return Err(ParseError::Timeout { timeout });
        }
        if !line.starts_with("```") {
            continue;
        }
        let mut block: Vec<&str> = Vec::new();
        for inner in lines.by_ref() {
            if Instant::now() >= deadline {
                return Err(ParseError::Timeout { timeout });
            }
            if inner.starts_with("```") {
                break;
            }
            block.push(inner);
        }
        for diff in parse_diff_block(&block) {
            if diffs.iter().any(|existing| existing.filename_post == diff.filename_post) {
                warn!(
                    "multiple diffs found for {}; only the first one is kept",
                    diff.filename_post
                );
            } else {
                diffs.push(diff);
            }
        }
    }

    if diffs.is_empty() {
        info!("no diff blocks found in the input");
    }
    Ok(diffs)
}

/// Parses the interior lines of one fenced block into zero or more diffs.
fn parse_diff_block(block: &[&str]) -> Vec<Diff> {
    let mut diffs: Vec<Diff> = Vec::new();
    let mut filename_pre: Option<String> = None;
    let mut header: Option<(usize, usize, usize, usize)> = None;
    let mut edits: Vec<LineEdit> = Vec::new();

    fn flush_hunk(
        diffs: &mut Vec<Diff>,
        header: &Option<(usize, usize, usize, usize)>,
        edits: &mut Vec<LineEdit>,
    ) {
        let pending = std::mem::take(edits);
        if pending.is_empty() {
            return;
        }
        if let (Some((a, b, c, d)), Some(diff)) = (*header, diffs.last_mut()) {
            diff.hunks.push(Hunk::new(a, b, c, d, pending));
        }
    }

    for line in block {
        if let Some(name) = line.strip_prefix("--- ") {
            filename_pre = Some(name.to_string());
        } else if let Some(name) = line.strip_prefix("+++ ") {
            // A new file pair begins; the pending hunk belongs to the
            // previous one.
            flush_hunk(&mut diffs, &header, &mut edits);
            let pre = filename_pre.clone().unwrap_or_default();
            diffs.push(Diff::new(pre, name.to_string()));
        } else if line.starts_with("@@ ") {
            flush_hunk(&mut diffs, &header, &mut edits);
            header = Some(parse_hunk_header(line));
        } else {
            // A hunk body line: ` `, `+` or `-` prefix. Anything else is
            // treated as context with its first character stripped, which is
            // what the wire format demands of well-formed input anyway.
            let mut chars = line.chars();
            let kind = match chars.next() {
                Some('+') => EditKind::Add,
                Some('-') => EditKind::Remove,
                _ => EditKind::Retain,
            };
            edits.push(LineEdit {
                kind,
                text: chars.as_str().to_string(),
            });
        }
    }
    flush_hunk(&mut diffs, &header, &mut edits);
    diffs
}

/// Parses a strict `@@ -start,len +start,len @@` header.
///
/// A malformed header yields all zeros instead of an error; the hunk is then
/// subject to full relocation by the validator.
fn parse_hunk_header(line: &str) -> (usize, usize, usize, usize) {
    let Some(caps) = HUNK_HEADER.captures(line) else {
        debug!("malformed hunk header '{line}'; defaulting to zeros");
        return (0, 0, 0, 0);
    };
    let num = |index: usize| -> usize { caps[index].parse().unwrap_or(0) };
    (num(1), num(2), num(3), num(4))
}

// --- Patch Applier ---

/// One slot of the post-edit file while edits are being replayed.
enum Slot {
    Text(String),
    Removed,
}

/// Replays corrected diffs over a [`FileContents`] mapping and returns the new
/// mapping. Diffs should be validated first; this function trusts the
/// coordinates it is given.
pub fn apply_diffs(diffs: &[Diff], files: &FileContents) -> FileContents {
    let mut files = files.clone();
    for diff in diffs {
        if diff.is_new_file() {
            // A brand-new file is the concatenation of everything the diff
            // keeps: retained and added lines, in order, across all hunks.
            let content = diff
                .hunks
                .iter()
                .flat_map(|hunk| hunk.edits().iter())
                .filter(|edit| edit.kind != EditKind::Remove)
                .map(|edit| edit.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            info!("creating {} ({} hunks)", diff.filename_post, diff.hunks.len());
            files.insert(PathBuf::from(&diff.filename_post), content);
            continue;
        }

        let Some(original) = files.get(Path::new(&diff.filename_pre)).cloned() else {
            warn!(
                "cannot apply diff for '{}': no such file in the working set",
                diff.filename_pre
            );
            continue;
        };
        // Integer-keyed slots allow inserts before line one (key zero) without
        // renumbering everything that follows.
        let mut slots: BTreeMap<i64, Slot> = original
            .split('\n')
            .enumerate()
            .map(|(index, text)| (index as i64 + 1, Slot::Text(text.to_string())))
            .collect();

        for hunk in &diff.hunks {
            let mut current = hunk.start_line_pre_edit as i64;
            for edit in hunk.edits() {
                match edit.kind {
                    EditKind::Retain => current += 1,
                    EditKind::Add => {
                        // Adds attach to the slot of the previous line;
                        // consecutive adds at one anchor pile up newline-joined.
                        let slot = slots.entry(current - 1).or_insert(Slot::Removed);
                        match slot {
                            Slot::Text(existing) => {
                                existing.push('\n');
                                existing.push_str(&edit.text);
                            }
                            Slot::Removed => *slot = Slot::Text(edit.text.clone()),
                        }
                    }
                    EditKind::Remove => {
                        slots.insert(current, Slot::Removed);
                        current += 1;
                    }
                }
            }
        }

        let new_content = slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Text(text) => Some(text.as_str()),
                Slot::Removed => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        files.insert(PathBuf::from(&diff.filename_post), new_content);
    }
    files
}

// --- Reconciliation Pipeline ---

/// The outcome of one reconciliation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    /// File contents after applying every surviving hunk.
    pub files: FileContents,
    /// Human-readable descriptions of everything that could not be applied,
    /// prefixed with the file each problem belongs to.
    pub problems: Vec<String>,
}

/// Validates already-parsed diffs against `files` and applies the survivors.
///
/// New-file diffs skip validation (they are unfalsifiable). A non-new-file
/// diff whose pre-edit file is missing from the mapping is dropped with a
/// problem. Problems never abort sibling diffs.
pub fn reconcile_diffs(
    mut diffs: Vec<Diff>,
    files: &FileContents,
    options: &ReconcileOptions,
) -> ReconcileResult {
    let mut problems = Vec::new();
    diffs.retain_mut(|diff| {
        if diff.is_new_file() {
            return true;
        }
        let Some(content) = files.get(Path::new(&diff.filename_pre)) else {
            problems.push(format!(
                "{}: the diff references a file that is not in the working set",
                diff.filename_pre
            ));
            return false;
        };
        let lines = content_to_line_map(content);
        for problem in diff.validate_and_correct(&lines, options) {
            problems.push(format!("{}: {}", diff.filename_post, problem));
        }
        true
    });

    let files = apply_diffs(&diffs, files);
    ReconcileResult { files, problems }
}

/// End-to-end reconciliation: parse `chat`, validate against `files`, apply.
///
/// A parse timeout is reported as a problem and treated as "no proposed
/// changes this cycle": the caller gets its input back untouched and can ask
/// the model to resend.
pub fn reconcile(chat: &str, files: &FileContents, options: &ReconcileOptions) -> ReconcileResult {
    let diffs = match parse_diffs(chat, options.diff_timeout) {
        Ok(diffs) => diffs,
        Err(error) => {
            warn!("{error}");
            return ReconcileResult {
                files: files.clone(),
                problems: vec![error.to_string()],
            };
        }
    };
    if diffs.is_empty() {
        info!("the reply did not contain any proposed changes");
        return ReconcileResult {
            files: files.clone(),
            problems: Vec::new(),
        };
    }
    reconcile_diffs(diffs, files, options)
}
