use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// A class record stored in the `class` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Class {
    /// Assigned by the storage layer on insert, immutable afterwards
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    #[serde(rename = "classid")]
    pub class_id: u32,

    #[serde(rename = "classname")]
    #[validate(length(min = 1, max = 128))]
    pub class_name: String,

    #[serde(rename = "classdesc", default, skip_serializing_if = "Option::is_none")]
    pub class_desc: Option<ClassDesc>,

    #[serde(default)]
    pub years: i32,

    /// Free text, covered by the `briefIdx` text index
    #[serde(default)]
    pub brief: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDesc {
    #[serde(rename = "stucount")]
    pub stu_count: i32,
    #[serde(rename = "teachercount")]
    pub teacher_count: i32,
}

impl Class {
    pub fn new(class_id: u32, class_name: impl Into<String>) -> Self {
        Class {
            id: None,
            class_id,
            class_name: class_name.into(),
            class_desc: None,
            years: 0,
            brief: String::new(),
        }
    }

    pub fn with_desc(mut self, stu_count: i32, teacher_count: i32) -> Self {
        self.class_desc = Some(ClassDesc {
            stu_count,
            teacher_count,
        });
        self
    }

    pub fn with_years(mut self, years: i32) -> Self {
        self.years = years;
        self
    }

    pub fn with_brief(mut self, brief: impl Into<String>) -> Self {
        self.brief = brief.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::utils::to_bson_document;

    fn cs3() -> Class {
        Class::new(3, "CS-3").with_desc(20, 2).with_years(13).with_brief("Sxs")
    }

    #[test]
    fn test_bson_field_names() {
        let doc = to_bson_document(&cs3()).unwrap();
        assert!(!doc.contains_key("_id"));
        assert_eq!(doc.get_i64("classid").unwrap(), 3);
        assert_eq!(doc.get_str("classname").unwrap(), "CS-3");
        let desc = doc.get_document("classdesc").unwrap();
        assert_eq!(desc.get_i32("stucount").unwrap(), 20);
        assert_eq!(desc.get_i32("teachercount").unwrap(), 2);
        assert_eq!(doc.get_i32("years").unwrap(), 13);
        assert_eq!(doc.get_str("brief").unwrap(), "Sxs");
    }

    #[test]
    fn test_decode_with_generated_id() {
        let id = ObjectId::new();
        let stored = bson::doc! { "_id": id, "classid": 4_i64, "classname": "MBA-4" };
        let class: Class = bson::from_document(stored).unwrap();
        assert_eq!(class.id, Some(id));
        assert_eq!(class.class_id, 4);
        assert_eq!(class.class_desc, None);
        assert_eq!(class.years, 0);
    }

    #[test]
    fn test_name_validation() {
        assert!(cs3().validate().is_ok());
        assert!(Class::new(1, "").validate().is_err());
    }
}
