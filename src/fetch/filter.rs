// src/fetch/filter.rs

use serde::Serialize;

/// The `e` query parameter of a segmentation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventFilter<'a> {
    pub event_type: &'a str,
    pub filters: Vec<PropertyFilter<'a>>,
    pub group_by: Vec<GroupBy<'a>>,
}

/// A user-property matcher; `subprop_type = "derivedV2"` targets a derived property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyFilter<'a> {
    pub group_type: &'a str,
    pub subprop_key: &'a str,
    pub subprop_op: &'a str,
    pub subprop_value: Vec<&'a str>,
    pub subprop_type: &'a str,
    pub subfilters: Vec<PropertyFilter<'a>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupBy<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub value: &'a str,
}

impl<'a> EventFilter<'a> {
    /// Select `event_type` for users whose derived `channel_property` is
    /// `channel`, one series per distinct `group_by` event property.
    pub fn for_channel(
        event_type: &'a str,
        channel_property: &'a str,
        channel: &'a str,
        group_by: &'a str,
    ) -> Self {
        Self {
            event_type,
            filters: vec![PropertyFilter {
                group_type: "User",
                subprop_key: channel_property,
                subprop_op: "is",
                subprop_value: vec![channel],
                subprop_type: "derivedV2",
                subfilters: Vec::new(),
            }],
            group_by: vec![GroupBy {
                kind: "event",
                value: group_by,
            }],
        }
    }
}
