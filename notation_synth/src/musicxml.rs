// Measure-level MusicXML model used to assemble pages.
//
// Page assembly only ever needs to count, concatenate, truncate, and break
// measures into systems, so a score is kept as the raw XML of its first
// part's measures rather than as a full object model. Each measure holds the
// verbatim source text of its child elements (notes, attributes, directions,
// barlines), which round-trips everything the renderer and label exporter
// read without having to understand it.
//
// Two things are interpreted on parse:
// - `<print>` elements are dropped; whether a measure opens a new system is
//   kept as `Measure::system_break` and re-emitted as
//   `<print new-system="yes"/>` on serialization. Layout is decided by the
//   page, not by the incipit's original engraving.
// - grace notes are flagged so `remove_grace_notes` can strip them (the
//   handwritten renderer has no glyphs for them).
//
// Measures are renumbered 1..=n on serialization. Only the first part is
// kept; PrIMuS incipits are single-staff.
//
// Raw element text is lifted with `roxmltree::Node::range`, so entity
// escaping and namespace prefixes in the source survive untouched.

use quick_xml::escape::escape;
use roxmltree::{Document, Node, ParsingOptions};

use crate::error::ScoreError;
use crate::layout::PageLayout;

/// One child element of a `<measure>`, as source text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeasureElement {
    pub name: String,
    pub xml: String,
    /// A `<note>` carrying `<grace/>`.
    pub grace: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Measure {
    /// Attributes of the `<measure>` tag except `number`.
    pub attributes: Vec<(String, String)>,
    pub elements: Vec<MeasureElement>,
    /// The measure starts a new system (or page).
    pub system_break: bool,
}

/// A single-part score at measure granularity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Score {
    /// Document text preceding the first `<part>` (declaration, doctype,
    /// root start tag, header, part list).
    prefix: String,
    root_name: String,
    part_id: String,
    measures: Vec<Measure>,
}

fn parsing_options() -> ParsingOptions {
    // MusicXML files normally carry a DOCTYPE.
    ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    }
}

fn is_yes(node: Node<'_, '_>, attribute: &str) -> bool {
    node.attribute(attribute) == Some("yes")
}

fn parse_measure(text: &str, node: Node<'_, '_>) -> Measure {
    let attributes = node
        .attributes()
        .filter(|a| a.name() != "number")
        .map(|a| (a.name().to_string(), a.value().to_string()))
        .collect();

    let mut elements = Vec::new();
    let mut system_break = false;
    for child in node.children().filter(Node::is_element) {
        let name = child.tag_name().name();
        if name == "print" {
            system_break |= is_yes(child, "new-system") || is_yes(child, "new-page");
            continue;
        }
        let grace = name == "note"
            && child
                .children()
                .any(|c| c.is_element() && c.tag_name().name() == "grace");
        elements.push(MeasureElement {
            name: name.to_string(),
            xml: text[child.range()].to_string(),
            grace,
        });
    }

    Measure {
        attributes,
        elements,
        system_break,
    }
}

impl Score {
    pub fn parse(text: &str) -> Result<Score, ScoreError> {
        let doc = Document::parse_with_options(text, parsing_options())?;
        let root = doc.root_element();
        let part = root
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "part")
            .ok_or(ScoreError::NoPart)?;

        let measures = part
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "measure")
            .map(|m| parse_measure(text, m))
            .collect();

        Ok(Score {
            prefix: text[..part.range().start].to_string(),
            root_name: root.tag_name().name().to_string(),
            part_id: part.attribute("id").unwrap_or("P1").to_string(),
            measures,
        })
    }

    pub fn measure_count(&self) -> usize {
        self.measures.len()
    }

    pub fn measures(&self) -> &[Measure] {
        &self.measures
    }

    /// Drop every grace note; returns how many were removed.
    pub fn remove_grace_notes(&mut self) -> usize {
        let mut removed = 0;
        for measure in &mut self.measures {
            let before = measure.elements.len();
            measure.elements.retain(|e| !e.grace);
            removed += before - measure.elements.len();
        }
        removed
    }

    /// Append the measures of every later score to the first one. The
    /// header (title, part list) of the first score is kept. A system break
    /// on the opening measure of a later score is cleared so that layout
    /// breaks can be placed freely afterwards.
    pub fn concatenate(scores: Vec<Score>) -> Result<Score, ScoreError> {
        let mut scores = scores.into_iter();
        let mut out = scores.next().ok_or(ScoreError::Empty)?;
        for score in scores {
            let mut measures = score.measures;
            if let Some(first) = measures.first_mut() {
                first.system_break = false;
            }
            out.measures.extend(measures);
        }
        Ok(out)
    }

    /// Keep only the first `measures` measures.
    pub fn truncate(&mut self, measures: usize) {
        self.measures.truncate(measures);
    }

    /// Mark the measure following each staff boundary of `layout` as the
    /// start of a new system. No break is placed after the last staff.
    /// Breaks carried over from the incipits' own engraving are cleared
    /// first, so the page has exactly the systems the layout asks for.
    pub fn insert_system_breaks(&mut self, layout: &PageLayout) {
        for measure in &mut self.measures {
            measure.system_break = false;
        }
        for boundary in layout.staff_boundaries() {
            if let Some(measure) = self.measures.get_mut(boundary) {
                measure.system_break = true;
            }
        }
    }

    /// Serialize back to a MusicXML document.
    pub fn to_musicxml(&self) -> String {
        let mut out = String::with_capacity(self.prefix.len() + self.measures.len() * 512);
        out.push_str(&self.prefix);
        out.push_str(&format!("<part id=\"{}\">\n", escape(&self.part_id)));
        for (i, measure) in self.measures.iter().enumerate() {
            out.push_str(&format!("    <measure number=\"{}\"", i + 1));
            for (name, value) in &measure.attributes {
                out.push_str(&format!(" {name}=\"{}\"", escape(value)));
            }
            out.push_str(">\n");
            if measure.system_break {
                out.push_str("      <print new-system=\"yes\"/>\n");
            }
            for element in &measure.elements {
                out.push_str("      ");
                out.push_str(&element.xml);
                out.push('\n');
            }
            out.push_str("    </measure>\n");
        }
        out.push_str("  </part>\n");
        out.push_str(&format!("</{}>\n", self.root_name));
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A one-part score with the given measure bodies.
    pub(crate) fn score_xml(measures: &[&str]) -> String {
        let mut xml = String::from(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE score-partwise PUBLIC "-//Recordare//DTD MusicXML 4.0 Partwise//EN" "http://www.musicxml.org/dtds/partwise.dtd">
<score-partwise version="4.0">
  <part-list>
    <score-part id="P1"><part-name>Voice</part-name></score-part>
  </part-list>
  <part id="P1">
"#,
        );
        for (i, body) in measures.iter().enumerate() {
            xml.push_str(&format!("    <measure number=\"{}\">{body}</measure>\n", i + 1));
        }
        xml.push_str("  </part>\n</score-partwise>\n");
        xml
    }

    fn note(step: &str) -> String {
        format!(
            "<note><pitch><step>{step}</step><octave>4</octave></pitch><duration>4</duration><type>whole</type></note>"
        )
    }

    #[test]
    fn test_parse_counts_measures() {
        let xml = score_xml(&[&note("C"), &note("D"), &note("E")]);
        let score = Score::parse(&xml).unwrap();
        assert_eq!(score.measure_count(), 3);
        assert_eq!(score.measures()[1].elements[0].name, "note");
    }

    #[test]
    fn test_missing_part_is_an_error() {
        let xml = "<score-partwise><part-list/></score-partwise>";
        assert!(matches!(Score::parse(xml), Err(ScoreError::NoPart)));
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        assert!(matches!(
            Score::parse("<score-partwise><part>"),
            Err(ScoreError::Xml(_))
        ));
    }

    #[test]
    fn test_print_elements_become_break_flags() {
        let xml = score_xml(&[
            &format!("<print><system-layout/></print>{}", note("C")),
            &format!("<print new-system=\"yes\"/>{}", note("D")),
            &format!("<print new-page=\"yes\"/>{}", note("E")),
        ]);
        let score = Score::parse(&xml).unwrap();
        let breaks: Vec<_> = score.measures().iter().map(|m| m.system_break).collect();
        assert_eq!(breaks, vec![false, true, true]);
        assert!(score.measures().iter().all(|m| m.elements.len() == 1));
    }

    #[test]
    fn test_remove_grace_notes() {
        let grace = "<note><grace/><pitch><step>B</step><octave>4</octave></pitch><type>eighth</type></note>";
        let xml = score_xml(&[&format!("{grace}{}", note("C")), &note("D")]);
        let mut score = Score::parse(&xml).unwrap();
        assert_eq!(score.remove_grace_notes(), 1);
        assert_eq!(score.measures()[0].elements.len(), 1);
        assert!(!score.to_musicxml().contains("<grace/>"));
    }

    #[test]
    fn test_concatenate_truncate_and_break() {
        let a = Score::parse(&score_xml(&[&note("C"), &note("D")])).unwrap();
        let b = Score::parse(&score_xml(&[
            &format!("<print new-system=\"yes\"/>{}", note("E")),
            &note("F"),
            &note("G"),
        ]))
        .unwrap();
        let mut page = Score::concatenate(vec![a, b]).unwrap();
        assert_eq!(page.measure_count(), 5);
        assert!(page.measures().iter().all(|m| !m.system_break));

        page.truncate(4);
        page.insert_system_breaks(&PageLayout::new(vec![2, 2]));
        let breaks: Vec<_> = page.measures().iter().map(|m| m.system_break).collect();
        assert_eq!(breaks, vec![false, false, true, false]);
    }

    #[test]
    fn test_layout_breaks_replace_engraved_ones() {
        let mut score = Score::parse(&score_xml(&[
            &note("C"),
            &format!("<print new-system=\"yes\"/>{}", note("D")),
            &note("E"),
            &note("F"),
        ]))
        .unwrap();
        score.insert_system_breaks(&PageLayout::new(vec![3, 1]));
        let breaks: Vec<_> = score.measures().iter().map(|m| m.system_break).collect();
        assert_eq!(breaks, vec![false, false, false, true]);
    }

    #[test]
    fn test_concatenate_nothing_is_an_error() {
        assert!(matches!(Score::concatenate(vec![]), Err(ScoreError::Empty)));
    }

    #[test]
    fn test_serialization_renumbers_and_reparses() {
        let xml = score_xml(&[&note("C"), &note("D")]);
        let a = Score::parse(&xml).unwrap();
        let b = Score::parse(&xml).unwrap();
        let mut page = Score::concatenate(vec![a, b]).unwrap();
        page.insert_system_breaks(&PageLayout::new(vec![3, 1]));
        let out = page.to_musicxml();

        for n in 1..=4 {
            assert!(out.contains(&format!("<measure number=\"{n}\">")), "{out}");
        }
        assert_eq!(out.matches("<print new-system=\"yes\"/>").count(), 1);
        assert!(out.contains("<part-name>Voice</part-name>"));

        let again = Score::parse(&out).unwrap();
        assert_eq!(again.measure_count(), 4);
        assert!(again.measures()[3].system_break);
    }

    #[test]
    fn test_measure_attributes_survive() {
        let xml = score_xml(&[&note("C")]).replace(
            "<measure number=\"1\">",
            "<measure number=\"0\" implicit=\"yes\" width=\"120.5\">",
        );
        let out = Score::parse(&xml).unwrap().to_musicxml();
        assert!(
            out.contains("<measure number=\"1\" implicit=\"yes\" width=\"120.5\">"),
            "{out}"
        );
    }
}
