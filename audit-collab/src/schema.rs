//! Typed audit report schema and its mapping onto Yrs shared types.
//!
//! Layout of the replica:
//! ```text
//! root map "report"
//!   ├── "title"    YText
//!   ├── "fields"   YMap<string>          (client, period, auditor, …)
//!   └── "sections" YArray<YMap>
//!                    ├── "id"       string
//!                    ├── "heading"  YText
//!                    ├── "body"     YText
//!                    └── "children" YArray<YMap>   (same shape, recursive)
//! ```
//!
//! [`write_report`] and [`read_report`] are the only places that know this
//! layout. Reading is lenient: plain strings are accepted where text nodes are
//! expected, and unknown keys are ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, GetString, Map, MapPrelim, MapRef, Out, ReadTxn, Text,
    TextPrelim, TextRef, TransactionMut, WriteTxn,
};

const ROOT: &str = "report";
const TITLE: &str = "title";
const FIELDS: &str = "fields";
const SECTIONS: &str = "sections";
const SECTION_ID: &str = "id";
const HEADING: &str = "heading";
const BODY: &str = "body";
const CHILDREN: &str = "children";

/// Plain projection of a report document.
///
/// This is what the storage layer keeps next to the binary replica and what
/// a cold start rebuilds the replica from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub title: String,
    /// Header fields of the report (client, fiscal period, lead auditor, …).
    pub fields: BTreeMap<String, String>,
    pub sections: Vec<Section>,
}

/// One section of a report. Sections nest arbitrarily deep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub heading: String,
    pub body: String,
    pub children: Vec<Section>,
}

impl ReportDocument {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.fields.is_empty() && self.sections.is_empty()
    }
}

impl Section {
    pub fn new(id: impl Into<String>, heading: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            heading: heading.into(),
            body: body.into(),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: Section) -> Self {
        self.children.push(child);
        self
    }
}

/// Write `report` into the replica root, replacing whatever the root held.
pub fn write_report(txn: &mut TransactionMut, report: &ReportDocument) {
    let root = txn.get_or_insert_map(ROOT);
    root.insert(txn, TITLE, TextPrelim::new(report.title.as_str()));

    let fields: MapRef = root.insert(txn, FIELDS, MapPrelim::default());
    for (key, value) in &report.fields {
        fields.insert(txn, key.as_str(), value.clone());
    }

    let sections: ArrayRef = root.insert(txn, SECTIONS, ArrayPrelim::default());
    for section in &report.sections {
        push_section(txn, &sections, section);
    }
}

fn push_section(txn: &mut TransactionMut, parent: &ArrayRef, section: &Section) {
    let node: MapRef = parent.push_back(txn, MapPrelim::default());
    node.insert(txn, SECTION_ID, section.id.clone());
    node.insert(txn, HEADING, TextPrelim::new(section.heading.as_str()));
    node.insert(txn, BODY, TextPrelim::new(section.body.as_str()));

    let children: ArrayRef = node.insert(txn, CHILDREN, ArrayPrelim::default());
    for child in &section.children {
        push_section(txn, &children, child);
    }
}

/// Project the replica into a [`ReportDocument`].
pub fn read_report<T: ReadTxn>(txn: &T) -> ReportDocument {
    let Some(root) = txn.get_map(ROOT) else {
        return ReportDocument::default();
    };

    let fields = match root.get(txn, FIELDS) {
        Some(Out::YMap(map)) => map
            .iter(txn)
            .filter_map(|(key, value)| string_value(txn, value).map(|v| (key.to_string(), v)))
            .collect(),
        _ => BTreeMap::new(),
    };

    ReportDocument {
        title: read_string(txn, &root, TITLE),
        fields,
        sections: read_sections(txn, root.get(txn, SECTIONS)),
    }
}

fn read_sections<T: ReadTxn>(txn: &T, node: Option<Out>) -> Vec<Section> {
    let Some(Out::YArray(array)) = node else {
        return Vec::new();
    };
    array
        .iter(txn)
        .filter_map(|item| match item {
            Out::YMap(map) => Some(read_section(txn, &map)),
            _ => None,
        })
        .collect()
}

fn read_section<T: ReadTxn>(txn: &T, map: &MapRef) -> Section {
    Section {
        id: read_string(txn, map, SECTION_ID),
        heading: read_string(txn, map, HEADING),
        body: read_string(txn, map, BODY),
        children: read_sections(txn, map.get(txn, CHILDREN)),
    }
}

fn read_string<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> String {
    map.get(txn, key)
        .and_then(|value| string_value(txn, value))
        .unwrap_or_default()
}

fn string_value<T: ReadTxn>(txn: &T, value: Out) -> Option<String> {
    match value {
        Out::YText(text) => Some(text.get_string(txn)),
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

/// The report title text node, if the replica has one.
pub fn title_text<T: ReadTxn>(txn: &T) -> Option<TextRef> {
    match txn.get_map(ROOT)?.get(txn, TITLE)? {
        Out::YText(text) => Some(text),
        _ => None,
    }
}

/// The body text node of the top-level section at `index`.
pub fn section_body<T: ReadTxn>(txn: &T, index: u32) -> Option<TextRef> {
    let Out::YArray(sections) = txn.get_map(ROOT)?.get(txn, SECTIONS)? else {
        return None;
    };
    let Out::YMap(section) = sections.get(txn, index)? else {
        return None;
    };
    match section.get(txn, BODY)? {
        Out::YText(text) => Some(text),
        _ => None,
    }
}

/// Set a header field on the report, creating the fields map if needed.
pub fn set_field(txn: &mut TransactionMut, key: &str, value: &str) {
    let root = txn.get_or_insert_map(ROOT);
    let fields = match root.get(txn, FIELDS) {
        Some(Out::YMap(map)) => map,
        _ => root.insert(txn, FIELDS, MapPrelim::default()),
    };
    fields.insert(txn, key, value.to_string());
}

/// Append `text` to the report title, creating the title node if needed.
pub fn append_title(txn: &mut TransactionMut, text: &str) {
    match title_text(txn) {
        Some(title) => title.push(txn, text),
        None => {
            let root = txn.get_or_insert_map(ROOT);
            root.insert(txn, TITLE, TextPrelim::new(text));
        }
    }
}
