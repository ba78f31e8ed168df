//! History item types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Lifecycle of a history item. Only ever moves `Draft -> Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
  Draft,
  Completed,
}

/// A durable record of past user activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
  pub id: String,
  #[serde(rename = "type")]
  pub item_type: String,
  pub name: String,
  #[serde(default)]
  pub data: Value,
  pub timestamp: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<HistoryStatus>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_modified: Option<DateTime<Utc>>,
}

impl HistoryItem {
  pub fn new(
    id: impl Into<String>,
    item_type: impl Into<String>,
    name: impl Into<String>,
    data: Value,
    status: HistoryStatus,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      id: id.into(),
      item_type: item_type.into(),
      name: name.into(),
      data,
      timestamp: now,
      status: Some(status),
      last_modified: Some(now),
    }
  }

  pub fn is_completed(&self) -> bool {
    self.status == Some(HistoryStatus::Completed)
  }

  /// Mark completed. There is no way back to draft.
  pub fn complete(&mut self, now: DateTime<Utc>) {
    self.status = Some(HistoryStatus::Completed);
    self.last_modified = Some(now);
  }

  /// Replace the payload (and optionally the name) without touching status.
  pub fn revise(&mut self, data: Value, name: Option<&str>, now: DateTime<Utc>) {
    self.data = data;
    if let Some(name) = name {
      self.name = name.to_string();
    }
    self.last_modified = Some(now);
  }

  /// A lightweight local stand-in for an item whose payload lives remotely.
  ///
  /// Keeps identity and a few summary counts so the item still lists.
  pub fn reference(&self, remote_id: &str) -> HistoryItem {
    let count = |field: &str| self.data.get(field).and_then(Value::as_array).map(Vec::len);
    let keyword_count = count("keywords")
      .or_else(|| count("selectedKeywords"))
      .unwrap_or(0);

    HistoryItem {
      data: json!({
        "savedToServer": true,
        "remoteId": remote_id,
        "url": self.data.get("url"),
        "structure": self.data.get("structure"),
        "keywordCount": keyword_count,
        "adCount": count("ads").unwrap_or(0),
      }),
      ..self.clone()
    }
  }

  /// Whether this item only references a remotely stored payload.
  pub fn is_reference(&self) -> bool {
    self.data.get("savedToServer").and_then(Value::as_bool) == Some(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
  }

  #[test]
  fn test_wire_format() {
    let item = HistoryItem::new("1", "plan", "Spring", json!({"a": 1}), HistoryStatus::Draft, at(0));
    let raw = serde_json::to_value(&item).unwrap();
    assert_eq!(raw["type"], "plan");
    assert_eq!(raw["status"], "draft");
    assert_eq!(raw["timestamp"], "1970-01-01T00:00:00Z");
    assert!(raw.get("lastModified").is_some());

    let back: HistoryItem = serde_json::from_value(raw).unwrap();
    assert_eq!(back, item);
  }

  #[test]
  fn test_optional_fields_may_be_missing() {
    let item: HistoryItem = serde_json::from_value(json!({
      "id": "1",
      "type": "plan",
      "name": "Old",
      "timestamp": "2024-01-01T00:00:00Z",
    }))
    .unwrap();
    assert_eq!(item.status, None);
    assert_eq!(item.data, Value::Null);
  }

  #[test]
  fn test_complete_then_revise_stays_completed() {
    let mut item = HistoryItem::new("1", "plan", "x", Value::Null, HistoryStatus::Draft, at(0));
    item.complete(at(5));
    item.revise(json!({"b": 2}), Some("y"), at(9));

    assert!(item.is_completed());
    assert_eq!(item.name, "y");
    assert_eq!(item.last_modified, Some(at(9)));
    assert_eq!(item.timestamp, at(0));
  }

  #[test]
  fn test_reference_summarises_payload() {
    let item = HistoryItem::new(
      "1",
      "plan",
      "Big",
      json!({
        "url": "https://example.com",
        "selectedKeywords": ["a", "b", "c"],
        "ads": [{}, {}],
        "blob": "x".repeat(1000),
      }),
      HistoryStatus::Completed,
      at(0),
    );

    let reference = item.reference("srv-42");
    assert!(reference.is_reference());
    assert_eq!(reference.id, "1");
    assert_eq!(reference.data["remoteId"], "srv-42");
    assert_eq!(reference.data["keywordCount"], 3);
    assert_eq!(reference.data["adCount"], 2);
    assert_eq!(reference.data["url"], "https://example.com");
    assert!(reference.data.get("blob").is_none());
  }
}
