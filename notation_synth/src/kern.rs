// Humdrum `**kern` labels for synthesized pages and staves.
//
// The label of a page is its MusicXML content exported as a single `**kern`
// spine: one token per line, interpretation lines (`*clefG2`, `*k[f#c#]`,
// `*M3/4`) where attributes appear, and a bare `=` between measures. The
// output is already "clean": no comments, no measure numbers on barlines, no
// leading or trailing barline, no spine terminator, so a page label can be
// sliced into per-staff labels by counting barlines.
//
// Pitch spelling follows kern: `c` is middle C (C4), each repeated letter
// goes one octave further out (`cc` = C5, `C` = C3, `CC` = C2). `#` and `-`
// are sharp and flat, `n` an explicit natural. Durations are reciprocals
// (`4` quarter, `8.` dotted eighth, `0` breve). Tuplets scale the reciprocal
// by actual/normal notes (`12` triplet eighth, `6` triplet quarter) and fall
// back to the rational form (`3%4`) when that is not a whole number.
//
// Interpretations are emitted clef first, then key, then meter, whatever
// order the attributes come in.
//
// Only the first voice of the first part is exported; everything after a
// `<backup>` in a measure belongs to another voice and is ignored.

use roxmltree::{Document, Node, ParsingOptions};

use crate::error::ScoreError;

/// Turns a page's MusicXML into its label text.
pub trait LabelExporter {
    fn export(&self, musicxml: &str) -> Result<String, ScoreError>;
}

/// Exports MusicXML as a single `**kern` spine.
#[derive(Clone, Copy, Debug, Default)]
pub struct KernExporter;

const EXCLUSIVE_INTERPRETATION: &str = "**kern";

/// Key signature accidentals in the order they are added.
const SHARP_ORDER: [&str; 7] = ["f#", "c#", "g#", "d#", "a#", "e#", "b#"];
const FLAT_ORDER: [&str; 7] = ["b-", "e-", "a-", "d-", "g-", "c-", "f-"];

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|c| c.text()).map(str::trim)
}

fn has_child(node: Node<'_, '_>, name: &str) -> bool {
    child(node, name).is_some()
}

/// Kern pitch name for a step/octave pair, e.g. ("C", 4) → "c", ("A", 2) → "AA".
pub fn kern_pitch(step: char, octave: i32) -> String {
    let lower = step.to_ascii_lowercase();
    let upper = step.to_ascii_uppercase();
    if octave >= 4 {
        std::iter::repeat_n(lower, (octave - 3) as usize).collect()
    } else {
        std::iter::repeat_n(upper, (4 - octave) as usize).collect()
    }
}

fn accidental_suffix(alter: i32, explicit_natural: bool) -> String {
    match alter {
        0 if explicit_natural => "n".to_string(),
        a if a > 0 => "#".repeat(a as usize),
        a => "-".repeat(a.unsigned_abs() as usize),
    }
}

/// Reciprocal duration for a MusicXML note type, as `(num, den)`: the note
/// fits `num / den` times into a whole note.
fn recip_for_type(note_type: &str) -> Option<(u32, u32)> {
    Some(match note_type {
        "long" => (1, 4),
        "breve" => (1, 2),
        "whole" => (1, 1),
        "half" => (2, 1),
        "quarter" => (4, 1),
        "eighth" => (8, 1),
        "16th" => (16, 1),
        "32nd" => (32, 1),
        "64th" => (64, 1),
        "128th" => (128, 1),
        _ => return None,
    })
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn format_recip(num: u32, den: u32) -> String {
    let g = gcd(num, den).max(1);
    match (num / g, den / g) {
        (n, 1) => n.to_string(),
        (1, 2) => "0".to_string(),
        (1, 4) => "00".to_string(),
        (n, d) => format!("{n}%{d}"),
    }
}

/// `(actual, normal)` of a note's `<time-modification>`, if it has one.
fn tuplet_ratio(note: Node<'_, '_>) -> Option<(u32, u32)> {
    let modification = child(note, "time-modification")?;
    let actual: u32 = child_text(modification, "actual-notes")?.parse().ok()?;
    let normal: u32 = child_text(modification, "normal-notes")?.parse().ok()?;
    (actual > 0 && normal > 0).then_some((actual, normal))
}

/// Reciprocal for a length given in quarter notes: plain, single-dotted, or
/// a whole-number reciprocal (tuplet values such as `12` or `6`).
/// Falls back to a whole note for lengths kern cannot spell in one token.
fn recip_for_quarters(quarters: f64) -> String {
    for n in [1u32, 2, 4, 8, 16, 32, 64] {
        let base = 4.0 / n as f64;
        if (quarters - base).abs() < 1e-9 {
            return n.to_string();
        }
        if (quarters - base * 1.5).abs() < 1e-9 {
            return format!("{n}.");
        }
    }
    if quarters > 0.0 {
        let recip = 4.0 / quarters;
        if recip <= 256.0 && (recip - recip.round()).abs() < 1e-6 {
            return (recip.round() as u32).to_string();
        }
    }
    "1".to_string()
}

fn clef_token(clef: Node<'_, '_>) -> Option<String> {
    let sign = child_text(clef, "sign")?;
    match sign {
        "percussion" => Some("*clefX".to_string()),
        _ => {
            let line = child_text(clef, "line").unwrap_or("");
            Some(format!("*clef{sign}{line}"))
        }
    }
}

fn key_token(key: Node<'_, '_>) -> Option<String> {
    let fifths: i32 = child_text(key, "fifths")?.parse().ok()?;
    let count = fifths.unsigned_abs().min(7) as usize;
    let order = if fifths >= 0 { &SHARP_ORDER } else { &FLAT_ORDER };
    Some(format!("*k[{}]", order[..count].concat()))
}

fn meter_token(time: Node<'_, '_>) -> Option<String> {
    let beats = child_text(time, "beats")?;
    let beat_type = child_text(time, "beat-type")?;
    Some(format!("*M{beats}/{beat_type}"))
}

/// Per-measure export state.
struct KernWriter {
    lines: Vec<String>,
    divisions: f64,
}

impl KernWriter {
    fn attributes(&mut self, attributes: Node<'_, '_>) {
        let divisions = child_text(attributes, "divisions").and_then(|d| d.parse::<f64>().ok());
        if let Some(d) = divisions.filter(|d| *d > 0.0) {
            self.divisions = d;
        }
        let clef = child(attributes, "clef").and_then(clef_token);
        let key = child(attributes, "key").and_then(key_token);
        let meter = child(attributes, "time").and_then(meter_token);
        self.lines.extend([clef, key, meter].into_iter().flatten());
    }

    fn note(&mut self, note: Node<'_, '_>) {
        let mut token = String::new();

        let ties: Vec<&str> = note
            .children()
            .filter(|c| c.is_element() && c.tag_name().name() == "tie")
            .filter_map(|t| t.attribute("type"))
            .collect();
        let tie_start = ties.contains(&"start");
        let tie_stop = ties.contains(&"stop");
        if tie_start && !tie_stop {
            token.push('[');
        }

        match child_text(note, "type").and_then(recip_for_type) {
            Some((num, den)) => {
                let (actual, normal) = tuplet_ratio(note).unwrap_or((1, 1));
                token.push_str(&format_recip(num * actual, den * normal));
                let dots = note
                    .children()
                    .filter(|c| c.is_element() && c.tag_name().name() == "dot")
                    .count();
                token.push_str(&".".repeat(dots));
            }
            None => {
                let duration = child_text(note, "duration")
                    .and_then(|d| d.parse::<f64>().ok())
                    .unwrap_or(self.divisions * 4.0);
                token.push_str(&recip_for_quarters(duration / self.divisions));
            }
        }

        if has_child(note, "rest") {
            token.push('r');
        } else if let Some(pitch) = child(note, "pitch") {
            let step = child_text(pitch, "step")
                .and_then(|s| s.chars().next())
                .unwrap_or('c');
            let octave = child_text(pitch, "octave")
                .and_then(|o| o.parse().ok())
                .unwrap_or(4);
            let alter = child_text(pitch, "alter")
                .and_then(|a| a.parse::<f64>().ok())
                .map(|a| a.round() as i32)
                .unwrap_or(0);
            let natural = child_text(note, "accidental") == Some("natural");
            token.push_str(&kern_pitch(step, octave));
            token.push_str(&accidental_suffix(alter, natural));
        } else {
            // unpitched
            token.push('r');
        }

        if tie_start && tie_stop {
            token.push('_');
        } else if tie_stop {
            token.push(']');
        }

        // Chord members share the line of the note they attach to.
        match self.lines.last_mut() {
            Some(previous) if has_child(note, "chord") && !previous.starts_with(['*', '=']) => {
                previous.push(' ');
                previous.push_str(&token);
            }
            _ => self.lines.push(token),
        }
    }

    fn measure(&mut self, measure: Node<'_, '_>) {
        for c in measure.children().filter(Node::is_element) {
            match c.tag_name().name() {
                "attributes" => self.attributes(c),
                "note" if !has_child(c, "grace") => self.note(c),
                "backup" => break,
                _ => {}
            }
        }
    }
}

impl LabelExporter for KernExporter {
    fn export(&self, musicxml: &str) -> Result<String, ScoreError> {
        let doc = Document::parse_with_options(
            musicxml,
            ParsingOptions {
                allow_dtd: true,
                ..ParsingOptions::default()
            },
        )?;
        let part = doc
            .root_element()
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "part")
            .ok_or(ScoreError::NoPart)?;

        let mut writer = KernWriter {
            lines: vec![EXCLUSIVE_INTERPRETATION.to_string()],
            divisions: 1.0,
        };
        let measures = part
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "measure");
        for (i, measure) in measures.enumerate() {
            if i > 0 {
                writer.lines.push("=".to_string());
            }
            writer.measure(measure);
        }
        Ok(writer.lines.join("\n"))
    }
}

fn is_interpretation(line: &str) -> bool {
    line.starts_with('*')
}

fn is_barline(line: &str) -> bool {
    line.starts_with('=')
}

/// Remove a barline that precedes all content and one that follows it.
pub fn remove_leading_and_trailing_barlines(lines: &mut Vec<&str>) {
    let content = |l: &&str| !(is_interpretation(l) || l.starts_with("!!") || l.trim().is_empty());

    if let Some(i) = lines.iter().position(content).filter(|&i| is_barline(lines[i])) {
        lines.remove(i);
    }
    if let Some(i) = lines.iter().rposition(content).filter(|&i| is_barline(lines[i])) {
        lines.remove(i);
    }
}

/// Interpretations that stay in force until restated: clef, key, meter.
const CARRIED_INTERPRETATIONS: [&str; 3] = ["*clef", "*k[", "*M"];

/// Cut measures `start..=end` (0-based) out of a page label.
///
/// A line belongs to the measure given by the number of barlines seen so far,
/// including its own. Slices that do not start at the first measure get the
/// clef, key, and meter in force at their start, so every slice is a
/// self-contained label.
pub fn slice_measures(kern: &str, start: usize, end: usize) -> String {
    debug_assert!(end >= start);

    let mut current = 0;
    let mut carried: [Option<&str>; 3] = [None; 3];
    let mut out: Vec<&str> = Vec::new();

    for line in kern.lines() {
        if is_barline(line) {
            current += 1;
        }
        if current < start {
            if let Some(slot) = CARRIED_INTERPRETATIONS
                .iter()
                .position(|prefix| line.starts_with(prefix))
            {
                carried[slot] = Some(line);
            }
        }
        if (start..=end).contains(&current) && !line.starts_with("**") {
            out.push(line);
        }
    }

    remove_leading_and_trailing_barlines(&mut out);

    let mut lines = vec![EXCLUSIVE_INTERPRETATION];
    if start > 0 {
        // Anything the slice already restates at its start wins.
        for (prefix, token) in CARRIED_INTERPRETATIONS.iter().zip(carried) {
            let Some(token) = token else { continue };
            let restated = out
                .iter()
                .take_while(|l| is_interpretation(l))
                .any(|l| l.starts_with(prefix));
            if !restated {
                lines.push(token);
            }
        }
    }
    lines.extend(out);
    lines.join("\n")
}
