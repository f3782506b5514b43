use serde::Serialize;

use crate::fields::{Field, FieldKind};

/// Column types understood by Tableau's web data connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableauType {
    String,
    Float,
    Int,
    Bool,
    Date,
    Datetime,
}

impl From<FieldKind> for TableauType {
    fn from(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Relation | FieldKind::Text => TableauType::String,
            FieldKind::Float => TableauType::Float,
            FieldKind::Integer => TableauType::Int,
            FieldKind::Boolean => TableauType::Bool,
            FieldKind::Date => TableauType::Date,
            FieldKind::DateTime => TableauType::Datetime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub id: &'static str,
    #[serde(rename = "dataType")]
    pub data_type: TableauType,
}

/// Schema of the daily statistics payload, one column per field in
/// canonical order.
pub fn columns() -> Vec<Column> {
    Field::ALL
        .iter()
        .map(|field| Column {
            id: field.as_str(),
            data_type: field.kind().into(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_cover_every_field() {
        let columns = columns();
        assert_eq!(columns.len(), Field::ALL.len());
        assert_eq!(
            columns[0],
            Column {
                id: "participant",
                data_type: TableauType::String
            }
        );
    }

    #[test]
    fn serializes_with_tableau_names() {
        let json = serde_json::to_value(columns()).unwrap();
        assert_eq!(json[2], serde_json::json!({"id": "date", "dataType": "date"}));
        assert_eq!(
            json[3],
            serde_json::json!({"id": "distance_diameter", "dataType": "float"})
        );
        let proximity = Field::DeviceProximity as usize;
        assert_eq!(json[proximity]["dataType"], "bool");
    }
}
