// MEI pre-processing applied to every incipit before normalization.
//
// PrIMuS encodes runs of empty bars as `<multiRest num="N"/>`. The renderer
// cannot draw multi-measure rests, and the label must describe exactly what is
// drawn, so every `multiRest` becomes a plain whole-measure rest `<mRest/>`
// with its attributes dropped. Everything else is streamed through unchanged
// (declaration, comments, whitespace and escaping included).

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::ScoreError;

const MULTI_REST: &[u8] = b"multiRest";

/// Replace every multi-measure rest with an attribute-less measure rest.
pub fn remove_multirests(mei: &str) -> Result<String, ScoreError> {
    let mut reader = Reader::from_str(mei);
    let mut writer = Writer::new(Vec::with_capacity(mei.len()));

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Empty(e) if e.local_name().as_ref() == MULTI_REST => {
                writer.write_event(Event::Empty(BytesStart::new(measure_rest_name(&e))))?;
            }
            Event::Start(e) if e.local_name().as_ref() == MULTI_REST => {
                writer.write_event(Event::Start(BytesStart::new(measure_rest_name(&e))))?;
            }
            Event::End(e) if e.local_name().as_ref() == MULTI_REST => {
                let name = String::from_utf8_lossy(e.name().as_ref()).replace("multiRest", "mRest");
                writer.write_event(Event::End(BytesEnd::new(name)))?;
            }
            event => writer.write_event(event)?,
        }
    }

    Ok(String::from_utf8(writer.into_inner())?)
}

/// `multiRest` → `mRest`, keeping any namespace prefix.
fn measure_rest_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).replace("multiRest", "mRest")
}
