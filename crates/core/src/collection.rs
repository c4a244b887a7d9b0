//! Target collection metadata as listed by the ingestion service.

use serde::{Deserialize, Serialize};

/// A field declared on a target collection.
///
/// The service lists fields either as bare names or as `{name, type}`
/// objects; both shapes deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawField")]
pub struct CollectionField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawField {
    Name(String),
    Full {
        name: String,
        #[serde(default, rename = "type")]
        field_type: Option<String>,
    },
}

impl From<RawField> for CollectionField {
    fn from(raw: RawField) -> Self {
        match raw {
            RawField::Name(name) => Self {
                name,
                field_type: None,
            },
            RawField::Full { name, field_type } => Self { name, field_type },
        }
    }
}

/// A collection the operator can import into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub collection_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub fields: Vec<CollectionField>,
}

impl Collection {
    /// Name shown to the operator.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.collection_name)
    }
}

/// Response body of `GET /collections`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionList {
    #[serde(default)]
    pub collections: Vec<Collection>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_field_shapes() {
        let json = r#"{"collections":[{"collectionName":"people","displayName":"People","fields":["name",{"name":"age","type":"int"}]}]}"#;
        let list: CollectionList = serde_json::from_str(json).unwrap();
        let people = &list.collections[0];
        assert_eq!(people.label(), "People");
        assert_eq!(people.fields[0].name, "name");
        assert!(people.fields[0].field_type.is_none());
        assert_eq!(people.fields[1].field_type.as_deref(), Some("int"));
    }

    #[test]
    fn label_falls_back_to_collection_name() {
        let json = r#"{"collectionName":"orders","displayName":""}"#;
        let c: Collection = serde_json::from_str(json).unwrap();
        assert_eq!(c.label(), "orders");
        assert!(c.fields.is_empty());
    }
}
