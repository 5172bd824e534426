//! Query, pipeline and index definitions used by the class DAO.

use std::time::Duration;

use bson::{Document, doc};
use mongodb::IndexModel;
use mongodb::options::IndexOptions;

/// Server-side time limit for distinct, aggregate and index builds
pub const MAX_TIME: Duration = Duration::from_secs(2);

/// How long a change stream waits for new events per round trip
pub const MAX_AWAIT_TIME: Duration = Duration::from_secs(2);

/// Upper bound on documents returned by a filtered find
pub const FIND_LIMIT: i64 = 50;

pub const BRIEF_INDEX_NAME: &str = "briefIdx";

/// Newest class ids first
pub fn class_sort() -> Document {
    doc! { "classid": -1 }
}

/// `select classname, max(years) from class group by classname`
pub fn max_years_by_name_pipeline() -> Vec<Document> {
    vec![doc! {
        "$group": {
            "_id": "$classname",
            "y": { "$max": "$years" },
        }
    }]
}

/// `select classname, count(1) from class group by classname`
pub fn count_by_name_pipeline() -> Vec<Document> {
    vec![doc! {
        "$group": {
            "_id": "$classname",
            "count": { "$sum": 1 },
        }
    }]
}

/// Change stream filter keeping insert events only
pub fn insert_events_pipeline() -> Vec<Document> {
    vec![doc! { "$match": { "operationType": "insert" } }]
}

/// Full-text index over the free-text annotation
pub fn brief_text_index() -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "brief": "text" })
        .options(IndexOptions::builder().name(BRIEF_INDEX_NAME.to_string()).build())
        .build()
}

/// A `$text` search expression.
///
/// Loose terms match documents containing any of them, phrases must all be
/// present, excluded terms must be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextQuery {
    pub terms: Vec<String>,
    pub phrases: Vec<String>,
    pub excluded: Vec<String>,
}

impl TextQuery {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.phrases.is_empty()
    }

    /// The `$search` string understood by the server
    pub fn search_string(&self) -> String {
        let terms = self.terms.iter().map(|t| t.to_string());
        let phrases = self.phrases.iter().map(|p| format!("\"{}\"", p.replace('"', "")));
        let excluded = self.excluded.iter().map(|t| format!("-{t}"));
        terms.chain(phrases).chain(excluded).collect::<Vec<_>>().join(" ")
    }

    pub fn filter(&self) -> Document {
        doc! { "$text": { "$search": self.search_string() } }
    }
}

/// Projection adding the relevance score of a text match
pub fn text_score_projection() -> Document {
    doc! { "score": { "$meta": "textScore" } }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::Bson;

    #[test]
    fn test_group_pipeline_shape() {
        let pipeline = max_years_by_name_pipeline();
        assert_eq!(pipeline.len(), 1);
        let group = pipeline[0].get_document("$group").unwrap();
        assert_eq!(group.get_str("_id").unwrap(), "$classname");
        assert_eq!(group.get_document("y").unwrap().get_str("$max").unwrap(), "$years");

        let group = &count_by_name_pipeline()[0];
        let count = group.get_document("$group").unwrap().get_document("count").unwrap();
        assert_eq!(count.get("$sum"), Some(&Bson::Int32(1)));
    }

    #[test]
    fn test_text_search_string() {
        let query = TextQuery {
            terms: vec![],
            phrases: vec!["ewtrwefs".into(), "wqD".into()],
            excluded: vec!["A".into()],
        };
        assert_eq!(query.search_string(), r#""ewtrwefs" "wqD" -A"#);

        let loose = TextQuery {
            terms: vec!["wqD".into(), "test".into()],
            ..TextQuery::default()
        };
        assert_eq!(loose.search_string(), "wqD test");
        assert_eq!(
            loose.filter(),
            doc! { "$text": { "$search": "wqD test" } }
        );
        assert!(TextQuery::default().is_empty());
    }

    #[test]
    fn test_text_index_definition() {
        let index = brief_text_index();
        assert_eq!(index.keys, doc! { "brief": "text" });
        let name = index.options.and_then(|o| o.name);
        assert_eq!(name.as_deref(), Some(BRIEF_INDEX_NAME));
    }

    #[test]
    fn test_insert_events_pipeline() {
        let stage = &insert_events_pipeline()[0];
        let matcher = stage.get_document("$match").unwrap();
        assert_eq!(matcher.get_str("operationType").unwrap(), "insert");
    }
}
