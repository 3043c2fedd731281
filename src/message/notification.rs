//! Notification descriptor
//!
//! The relay expects the `notification` object as one flat JSON map. The
//! well-known keys are modelled as fields; anything else goes in `extras`.
//! When `to_map` merges the two, a set well-known field wins over an extra
//! with the same key.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub sound: Option<String>,
    pub tag: Option<String>,
    pub color: Option<String>,
    pub click_action: Option<String>,
    pub body_loc_key: Option<String>,
    pub body_loc_args: Option<String>,
    pub title_loc_key: Option<String>,
    pub title_loc_args: Option<String>,
    pub extras: Map<String, Value>,
}

impl NotificationPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn sound(mut self, sound: impl Into<String>) -> Self {
        self.sound = Some(sound.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn click_action(mut self, action: impl Into<String>) -> Self {
        self.click_action = Some(action.into());
        self
    }

    pub fn body_localization(mut self, key: impl Into<String>, args: Option<String>) -> Self {
        self.body_loc_key = Some(key.into());
        self.body_loc_args = args;
        self
    }

    pub fn title_localization(mut self, key: impl Into<String>, args: Option<String>) -> Self {
        self.title_loc_key = Some(key.into());
        self.title_loc_args = args;
        self
    }

    /// Adds a caller-defined field to the payload.
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    fn well_known(&self) -> [(&'static str, &Option<String>); 11] {
        [
            ("title", &self.title),
            ("body", &self.body),
            ("icon", &self.icon),
            ("sound", &self.sound),
            ("tag", &self.tag),
            ("color", &self.color),
            ("click_action", &self.click_action),
            ("body_loc_key", &self.body_loc_key),
            ("body_loc_args", &self.body_loc_args),
            ("title_loc_key", &self.title_loc_key),
            ("title_loc_args", &self.title_loc_args),
        ]
    }

    /// Flattens the descriptor into the map placed under `notification`.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = self.extras.clone();
        for (key, value) in self.well_known() {
            if let Some(value) = value {
                map.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        map
    }
}
