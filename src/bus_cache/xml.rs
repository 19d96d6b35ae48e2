//! Tag-insensitive extraction of the flat dataset table embedded in the bus
//! SOAP response. The upstream is known to vary field-name casing and style
//! between deployments (`SGUNTIPI`, `sguntipi`, `GunTipi`), so every row is
//! parsed into a lowercased field map first and candidate names are tried in
//! order rather than binding to one exact tag.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::name::QName;
use quick_xml::Reader;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("xml parse error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("row missing required field among {0:?}")]
    MissingField(Vec<&'static str>),
}

#[derive(Debug, Clone)]
pub struct RawScheduleRow {
    pub day_type: String,
    pub direction: String,
    pub time: String,
    pub route_name: String,
}

const TABLE_TAGS: &[&str] = &["table"];
const DAY_TYPE_FIELDS: &[&str] = &["sguntipi", "guntipi", "daytype"];
const DIRECTION_FIELDS: &[&str] = &["yon", "direction", "yonu"];
const TIME_FIELDS: &[&str] = &["saat", "time", "saati"];
const ROUTE_NAME_FIELDS: &[&str] = &["guzergahadi", "hatadi", "routename"];

pub fn parse_rows(xml_text: &str) -> Result<Vec<RawScheduleRow>, Error> {
    let raw_rows = parse_tables(xml_text)?;
    let mut out = Vec::with_capacity(raw_rows.len());
    for row in raw_rows {
        let day_type = first_present(&row, DAY_TYPE_FIELDS)?;
        let direction = first_present(&row, DIRECTION_FIELDS)?;
        let time = first_present(&row, TIME_FIELDS)?;
        let route_name = first_present(&row, ROUTE_NAME_FIELDS).unwrap_or_default();
        out.push(RawScheduleRow {
            day_type,
            direction,
            time,
            route_name,
        });
    }
    Ok(out)
}

fn first_present(row: &HashMap<String, String>, candidates: &[&'static str]) -> Result<String, Error> {
    for candidate in candidates {
        if let Some(value) = row.get(*candidate) {
            return Ok(value.clone());
        }
    }
    Err(Error::MissingField(candidates.to_vec()))
}

fn parse_tables(xml_text: &str) -> Result<Vec<HashMap<String, String>>, Error> {
    let mut reader = Reader::from_str(xml_text);
    reader.config_mut().trim_text(true);

    let mut rows = Vec::new();
    let mut current: Option<HashMap<String, String>> = None;
    let mut current_field: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = local_name_lower(e.name());
                if TABLE_TAGS.contains(&name.as_str()) {
                    current = Some(HashMap::new());
                } else if current.is_some() {
                    current_field = Some(name);
                }
            }
            Event::Text(t) => {
                if let (Some(map), Some(field)) = (current.as_mut(), current_field.as_ref()) {
                    let text = t.unescape().unwrap_or_default().into_owned();
                    map.insert(field.clone(), text);
                }
            }
            Event::End(e) => {
                let name = local_name_lower(e.name());
                if TABLE_TAGS.contains(&name.as_str()) {
                    if let Some(map) = current.take() {
                        rows.push(map);
                    }
                } else if current_field.as_deref() == Some(name.as_str()) {
                    current_field = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(rows)
}

fn local_name_lower(name: QName) -> String {
    let local = name.local_name();
    String::from_utf8_lossy(local.as_ref()).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaced_and_mixed_case_fields() {
        let xml = r#"
        <DocumentElement>
          <NewDataSet>
            <Table>
              <SGUNTIPI>I</SGUNTIPI>
              <YON>G</YON>
              <SAAT>08:15</SAAT>
              <GUZERGAHADI>TAKSIM - 4.LEVENT</GUZERGAHADI>
            </Table>
            <Table>
              <sguntipi>I</sguntipi>
              <yon>D</yon>
              <saat>08:45</saat>
              <guzergahadi>4.LEVENT - TAKSIM</guzergahadi>
            </Table>
          </NewDataSet>
        </DocumentElement>
        "#;

        let rows = parse_rows(xml).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].day_type, "I");
        assert_eq!(rows[0].direction, "G");
        assert_eq!(rows[1].time, "08:45");
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let xml = "<Table><YON>G</YON><SAAT>08:00</SAAT></Table>";
        assert!(parse_rows(xml).is_err());
    }
}
