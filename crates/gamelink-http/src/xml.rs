//! Streaming parse of the host's XML response envelope.
//!
//! Every control-plane response is wrapped in
//! `<root status_code=".." status_message="..">`. Parsing is a single pull
//! pass: the envelope status is checked the moment the root element is seen,
//! so a non-200 response surfaces as [`HttpError::Status`] no matter which
//! field the caller asked for.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use gamelink_core::AppEntry;

use crate::errors::HttpError;

fn malformed(e: impl std::fmt::Display) -> HttpError {
    HttpError::malformed_xml(e.to_string())
}

fn verify_response_status(e: &BytesStart<'_>) -> Result<(), HttpError> {
    let code_attr = e
        .try_get_attribute("status_code")
        .map_err(malformed)?
        .ok_or_else(|| HttpError::malformed_xml("root element missing status_code"))?;
    let code_text = code_attr.unescape_value().map_err(malformed)?;

    // Hosts occasionally report 0xFFFFFFFF here, which overflows i32. Parse
    // wide and truncate so that case comes out as the intended -1.
    let status_code = code_text
        .parse::<i64>()
        .map_err(|_| HttpError::malformed_xml(format!("bad status_code: {code_text}")))?
        as i32;
    if status_code == 200 {
        return Ok(());
    }

    let mut message = match e.try_get_attribute("status_message").map_err(malformed)? {
        Some(attr) => attr.unescape_value().map_err(malformed)?.into_owned(),
        None => String::new(),
    };
    let mut code = status_code;
    if code == -1 && message == "Invalid" {
        // The host reports a missing audio capture device with this useless
        // -1/"Invalid" combination; remap it to something displayable.
        code = 418;
        message = "Missing audio capture device on the host".to_owned();
    }
    Err(HttpError::Status { code, message })
}

/// Extract the text of the first `tag` element, validating the response
/// envelope on the way. Returns `Ok(None)` when the tag never appears.
pub fn get_xml_string(xml: &str, tag: &str) -> Result<Option<String>, HttpError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut current_tag: Vec<String> = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "root" {
                    verify_response_status(&e)?;
                }
                current_tag.push(name);
            }
            Ok(Event::Empty(e)) => {
                if e.name().as_ref() == b"root" {
                    verify_response_status(&e)?;
                }
            }
            Ok(Event::End(_)) => {
                current_tag.pop();
            }
            Ok(Event::Text(t)) => {
                if current_tag.last().map(String::as_str) == Some(tag) {
                    return Ok(Some(t.unescape().map_err(malformed)?.into_owned()));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(malformed(e)),
        }
    }
}

/// Like [`get_xml_string`] but the field is mandatory.
pub fn require_xml_string(xml: &str, tag: &'static str) -> Result<String, HttpError> {
    get_xml_string(xml, tag)?.ok_or(HttpError::MissingField { field: tag })
}

#[derive(Default)]
struct PartialApp {
    id: Option<i32>,
    title: Option<String>,
    hdr_supported: bool,
}

/// Parse an `/applist` response into app entries.
///
/// Entries missing a required field are dropped without aborting the rest of
/// the list. A response whose `</root>` never arrives is a truncated transfer
/// and raises a malformed-XML error rather than returning a partial list.
pub fn parse_app_list(xml: &str) -> Result<Vec<AppEntry>, HttpError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut current_tag: Vec<String> = Vec::new();
    let mut apps: Vec<PartialApp> = Vec::new();
    let mut root_terminated = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "root" {
                    verify_response_status(&e)?;
                }
                if name == "App" {
                    apps.push(PartialApp::default());
                }
                current_tag.push(name);
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"root" {
                    root_terminated = true;
                }
                current_tag.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(malformed)?;
                if let (Some(tag), Some(app)) = (current_tag.last(), apps.last_mut()) {
                    match tag.as_str() {
                        "AppTitle" => app.title = Some(text.into_owned()),
                        "ID" => app.id = text.parse().ok(),
                        "IsHdrSupported" => app.hdr_supported = text.as_ref() == "1",
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(malformed(e)),
        }
    }

    if !root_terminated {
        return Err(HttpError::malformed_xml("root tag was not terminated"));
    }

    Ok(apps
        .into_iter()
        .filter_map(|app| match (app.id, app.title) {
            (Some(id), Some(title)) => Some(AppEntry {
                id,
                title,
                hdr_supported: app.hdr_supported,
            }),
            (id, title) => {
                warn!("Host returned incomplete app entry: id={id:?} title={title:?}");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tag_text() {
        let xml = r#"<root status_code="200"><hostname>desktop</hostname></root>"#;
        assert_eq!(
            get_xml_string(xml, "hostname").unwrap(),
            Some("desktop".to_owned())
        );
        assert_eq!(get_xml_string(xml, "uniqueid").unwrap(), None);
    }

    #[test]
    fn non_200_envelope_raises_status_error() {
        let xml = r#"<root status_code="401" status_message="Not paired"><x>1</x></root>"#;
        match get_xml_string(xml, "x") {
            Err(HttpError::Status { code: 401, message }) => assert_eq!(message, "Not paired"),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn overflowing_status_code_truncates_to_negative() {
        let xml = format!(r#"<root status_code="{}" status_message="Invalid"/>"#, 0xFFFFFFFFu32);
        match get_xml_string(&xml, "x") {
            Err(HttpError::Status { code: 418, .. }) => {}
            other => panic!("expected remapped 418, got {other:?}"),
        }
    }

    #[test]
    fn app_list_drops_incomplete_entries() {
        let xml = r#"<root status_code="200">
            <App><ID>1</ID><AppTitle>Steam</AppTitle><IsHdrSupported>1</IsHdrSupported></App>
            <App><ID>2</ID></App>
            <App><ID>3</ID><AppTitle>Desktop</AppTitle><IsHdrSupported>0</IsHdrSupported></App>
        </root>"#;
        let apps = parse_app_list(xml).unwrap();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].id, 1);
        assert!(apps[0].hdr_supported);
        assert_eq!(apps[1].title, "Desktop");
    }

    #[test]
    fn truncated_app_list_is_malformed() {
        let xml = r#"<root status_code="200"><App><ID>1</ID><AppTitle>Steam</AppTitle></App>"#;
        match parse_app_list(xml) {
            Err(HttpError::MalformedXml { .. }) => {}
            other => panic!("expected malformed XML error, got {other:?}"),
        }
    }
}
