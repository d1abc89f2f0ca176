use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{optional_str, required_str, Tool};
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::ToolResult;

pub const DEFAULT_CATEGORY: &str = "general";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub timestamp: DateTime<Local>,
    pub category: String,
    pub content: String,
}

/// JSON file of notes shared by the record and recall tools.
///
/// Nothing touches the disk until the first note is recorded.
#[derive(Clone)]
pub struct NoteStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl NoteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> AgentResult<Vec<Note>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AgentError::ExecutionError(format!("Failed to read notes: {}", e)))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw)
            .map_err(|e| AgentError::ExecutionError(format!("Corrupt note file: {}", e)))
    }

    pub async fn record(&self, category: &str, content: &str) -> AgentResult<Note> {
        let _guard = self.lock.lock().await;

        let mut notes = self.load().await?;
        let note = Note {
            timestamp: Local::now(),
            category: category.to_string(),
            content: content.to_string(),
        };
        notes.push(note.clone());

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AgentError::ExecutionError(format!("Failed to create note directory: {}", e))
            })?;
        }
        let serialized = serde_json::to_string_pretty(&notes)
            .map_err(|e| AgentError::Internal(e.to_string()))?;
        tokio::fs::write(&self.path, serialized)
            .await
            .map_err(|e| AgentError::ExecutionError(format!("Failed to write notes: {}", e)))?;

        Ok(note)
    }

    pub async fn recall(&self, category: Option<&str>) -> AgentResult<Vec<Note>> {
        let _guard = self.lock.lock().await;
        let notes = self.load().await?;
        Ok(match category {
            Some(category) => notes
                .into_iter()
                .filter(|note| note.category == category)
                .collect(),
            None => notes,
        })
    }
}

pub struct RecordNoteTool {
    store: NoteStore,
}

impl RecordNoteTool {
    pub fn new(store: NoteStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for RecordNoteTool {
    fn name(&self) -> &str {
        "record_note"
    }

    fn description(&self) -> &str {
        "Record important information as a timestamped note: key facts, user preferences, \
         decisions or context worth recalling later in the session."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The information to record. Be concise but specific."
                },
                "category": {
                    "type": "string",
                    "description": "Optional category such as 'user_preference', 'project_info' or 'decision'."
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        let content = match required_str(&arguments, "content") {
            Ok(content) => content,
            Err(e) => return ToolResult::failure(e.to_string()),
        };
        let category = optional_str(&arguments, "category")
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CATEGORY);

        match self.store.record(category, content).await {
            Ok(_) => ToolResult::success(format!(
                "Recorded note: {} (category: {})",
                content, category
            )),
            Err(e) => ToolResult::failure(format!("Failed to record note: {}", e)),
        }
    }
}

pub struct RecallNotesTool {
    store: NoteStore,
}

impl RecallNotesTool {
    pub fn new(store: NoteStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for RecallNotesTool {
    fn name(&self) -> &str {
        "recall_notes"
    }

    fn description(&self) -> &str {
        "Recall previously recorded notes, optionally only those in one category."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "category": {
                    "type": "string",
                    "description": "Optional category to filter by."
                }
            }
        })
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        let category = optional_str(&arguments, "category").filter(|c| !c.is_empty());

        let notes = match self.store.recall(category).await {
            Ok(notes) => notes,
            Err(e) => return ToolResult::failure(format!("Failed to recall notes: {}", e)),
        };

        if notes.is_empty() {
            return ToolResult::success(match category {
                Some(category) => format!("No notes found in category: {}", category),
                None => "No notes recorded yet.".to_string(),
            });
        }

        let formatted = notes
            .iter()
            .enumerate()
            .map(|(i, note)| {
                format!(
                    "{}. [{}] {}\n   (recorded at {})",
                    i + 1,
                    note.category,
                    note.content,
                    note.timestamp.format("%Y-%m-%d %H:%M:%S")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        ToolResult::success(format!("Recorded Notes:\n{}", formatted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_and_recall() {
        let dir = TempDir::new().unwrap();
        let store = NoteStore::new(dir.path().join("memory/notes.json"));
        let record = RecordNoteTool::new(store.clone());
        let recall = RecallNotesTool::new(store.clone());

        assert!(!store.path().exists());
        let empty = recall.execute(json!({})).await;
        assert_eq!(empty.content, "No notes recorded yet.");
        assert!(!store.path().exists());

        let result = record
            .execute(json!({"content": "User prefers concise responses", "category": "user_preference"}))
            .await;
        assert!(result.success);
        assert_eq!(
            result.content,
            "Recorded note: User prefers concise responses (category: user_preference)"
        );

        record
            .execute(json!({"content": "Project uses Rust 2021"}))
            .await;

        let all = recall.execute(json!({})).await;
        assert!(all.content.starts_with("Recorded Notes:\n1. [user_preference] User prefers concise responses"));
        assert!(all.content.contains("2. [general] Project uses Rust 2021"));

        let filtered = recall.execute(json!({"category": "user_preference"})).await;
        assert!(!filtered.content.contains("Rust 2021"));

        let none = recall.execute(json!({"category": "decision"})).await;
        assert_eq!(none.content, "No notes found in category: decision");
    }

    #[tokio::test]
    async fn test_file_format() {
        let dir = TempDir::new().unwrap();
        let store = NoteStore::new(dir.path().join("notes.json"));
        store.record("project_info", "uses tokio").await.unwrap();

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        let notes = raw.as_array().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0]["category"], "project_info");
        assert_eq!(notes[0]["content"], "uses tokio");
        assert!(notes[0]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_record_requires_content() {
        let dir = TempDir::new().unwrap();
        let record = RecordNoteTool::new(NoteStore::new(dir.path().join("notes.json")));

        let result = record.execute(json!({"category": "x"})).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("content"));
    }
}
