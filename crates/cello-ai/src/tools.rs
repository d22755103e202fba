// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The notebook tool set exposed to the model.
//!
//! Three small tools, each a couple of store commits; return values are
//! short status strings the model reads as tool results.

use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use cello_model::ToolSchema;
use cello_store::{
    Cell, CellType, ExecutionQueueEntry, NotebookEvent, QueueStatus, Record, Selector, Store,
};

/// Where a created cell lands relative to the AI cell that asked for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatePosition {
    BeforeCurrent,
    AfterCurrent,
    AtEnd,
}

#[derive(Debug, Deserialize)]
struct CreateCellArgs {
    #[serde(rename = "cellType")]
    cell_type: CellType,
    content: String,
    position: CreatePosition,
}

#[derive(Debug, Deserialize)]
struct ModifyCellArgs {
    #[serde(rename = "cellId")]
    cell_id: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ExecuteCellArgs {
    #[serde(rename = "cellId")]
    cell_id: String,
}

pub struct NotebookTools {
    store: Arc<dyn Store>,
    session_id: String,
}

impl NotebookTools {
    pub fn new(store: Arc<dyn Store>, session_id: impl Into<String>) -> Self {
        Self { store, session_id: session_id.into() }
    }

    /// Schemas handed to the model on every turn.
    pub fn schemas() -> Vec<ToolSchema> {
        vec![
            ToolSchema {
                name: "create_cell".into(),
                description: "Create a new notebook cell with the given content.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "cellType": {
                            "type": "string",
                            "enum": ["code", "markdown", "raw", "sql", "ai"],
                        },
                        "content": { "type": "string" },
                        "position": {
                            "type": "string",
                            "enum": ["before_current", "after_current", "at_end"],
                        },
                    },
                    "required": ["cellType", "content", "position"],
                }),
            },
            ToolSchema {
                name: "modify_cell".into(),
                description: "Replace the source of an existing cell.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "cellId": { "type": "string" },
                        "content": { "type": "string" },
                    },
                    "required": ["cellId", "content"],
                }),
            },
            ToolSchema {
                name: "execute_cell".into(),
                description: "Queue an existing code cell for execution.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "cellId": { "type": "string" },
                    },
                    "required": ["cellId"],
                }),
            },
        ]
    }

    /// Run one tool call against the notebook.  `current` is the AI cell
    /// driving the conversation.
    pub async fn dispatch(&self, current: &Cell, name: &str, args: &Value) -> anyhow::Result<String> {
        match name {
            "create_cell" => {
                let args: CreateCellArgs =
                    serde_json::from_value(args.clone()).context("invalid create_cell arguments")?;
                self.create_cell(current, args).await
            }
            "modify_cell" => {
                let args: ModifyCellArgs =
                    serde_json::from_value(args.clone()).context("invalid modify_cell arguments")?;
                self.modify_cell(args).await
            }
            "execute_cell" => {
                let args: ExecuteCellArgs = serde_json::from_value(args.clone())
                    .context("invalid execute_cell arguments")?;
                self.execute_cell(args).await
            }
            other => bail!("unknown tool: {other}"),
        }
    }

    async fn create_cell(&self, current: &Cell, args: CreateCellArgs) -> anyhow::Result<String> {
        let position = match args.position {
            CreatePosition::BeforeCurrent => current.position - 0.1,
            CreatePosition::AfterCurrent => current.position + 0.1,
            CreatePosition::AtEnd => self.max_position().await? + 1.0,
        };

        let cell_id = Uuid::new_v4().to_string();
        let cell = Cell::new(cell_id.clone(), args.cell_type, "", position);
        self.store
            .commit(NotebookEvent::CellCreated { cell })
            .await
            .map_err(|e| anyhow::anyhow!("cell creation failed: {e}"))?;
        self.store
            .commit(NotebookEvent::CellSourceChanged {
                cell_id: cell_id.clone(),
                source: args.content,
            })
            .await
            .map_err(|e| anyhow::anyhow!("cell source update failed: {e}"))?;

        Ok(format!("Created {} cell {cell_id}", args.cell_type))
    }

    async fn modify_cell(&self, args: ModifyCellArgs) -> anyhow::Result<String> {
        if self.load_cell(&args.cell_id).await?.is_none() {
            bail!("Cell {} not found", args.cell_id);
        }
        self.store
            .commit(NotebookEvent::CellSourceChanged {
                cell_id: args.cell_id.clone(),
                source: args.content,
            })
            .await
            .map_err(|e| anyhow::anyhow!("cell source update failed: {e}"))?;
        Ok(format!("Updated cell {}", args.cell_id))
    }

    async fn execute_cell(&self, args: ExecuteCellArgs) -> anyhow::Result<String> {
        let cell = self
            .load_cell(&args.cell_id)
            .await?
            .with_context(|| format!("Cell {} not found", args.cell_id))?;
        if cell.cell_type != CellType::Code {
            bail!("Only code cells can be executed, {} is a {} cell", cell.id, cell.cell_type);
        }

        let queue_id = Uuid::new_v4().to_string();
        let entry = ExecutionQueueEntry {
            id: queue_id.clone(),
            cell_id: cell.id.clone(),
            execution_count: cell.execution_count + 1,
            requested_by: format!("ai-assistant-{}", self.session_id),
            priority: 0,
            status: QueueStatus::Pending,
            assigned_runtime_session: None,
            started_at: None,
            completed_at: None,
            execution_duration_ms: None,
            error: None,
        };
        self.store
            .commit(NotebookEvent::ExecutionRequested { entry })
            .await
            .map_err(|e| anyhow::anyhow!("execution request failed: {e}"))?;
        Ok(format!("Queued execution of cell {} ({queue_id})", cell.id))
    }

    async fn load_cell(&self, cell_id: &str) -> anyhow::Result<Option<Cell>> {
        let records = self
            .store
            .query(Selector::CellById { cell_id: cell_id.to_string() })
            .await
            .map_err(|e| anyhow::anyhow!("cell query failed: {e}"))?;
        Ok(records.into_iter().find_map(|r| match r {
            Record::Cell(c) => Some(c),
            _ => None,
        }))
    }

    async fn max_position(&self) -> anyhow::Result<f64> {
        let records = self
            .store
            .query(Selector::AllCells)
            .await
            .map_err(|e| anyhow::anyhow!("cell query failed: {e}"))?;
        Ok(records
            .iter()
            .filter_map(Record::as_cell)
            .map(|c| c.position)
            .fold(0.0_f64, f64::max))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cello_store::MemoryStore;

    fn tools(store: &MemoryStore) -> NotebookTools {
        NotebookTools::new(Arc::new(store.clone()), "sess-1")
    }

    fn current_cell() -> Cell {
        Cell::new("ai-1", CellType::Ai, "make a cell", 2.0)
    }

    async fn cells(store: &MemoryStore) -> Vec<Cell> {
        store
            .query(Selector::AllCells)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|r| match r {
                Record::Cell(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn create_cell_after_current_uses_fractional_position() {
        let store = MemoryStore::new();
        store.seed_cell(current_cell()).await;
        let tools = tools(&store);

        let args = json!({
            "cellType": "code",
            "content": "print('hello')",
            "position": "after_current",
        });
        let status = tools.dispatch(&current_cell(), "create_cell", &args).await.unwrap();
        assert!(status.starts_with("Created code cell"));

        let cells = cells(&store).await;
        let created = cells.iter().find(|c| c.id != "ai-1").unwrap();
        assert!((created.position - 2.1).abs() < 1e-9);
        assert_eq!(created.source, "print('hello')");
        assert_eq!(created.cell_type, CellType::Code);
    }

    #[tokio::test]
    async fn create_cell_before_current_and_at_end() {
        let store = MemoryStore::new();
        store.seed_cell(current_cell()).await;
        store.seed_cell(Cell::new("tail", CellType::Code, "", 7.0)).await;
        let tools = tools(&store);

        tools
            .dispatch(
                &current_cell(),
                "create_cell",
                &json!({"cellType": "markdown", "content": "a", "position": "before_current"}),
            )
            .await
            .unwrap();
        tools
            .dispatch(
                &current_cell(),
                "create_cell",
                &json!({"cellType": "markdown", "content": "b", "position": "at_end"}),
            )
            .await
            .unwrap();

        let cells = cells(&store).await;
        let before = cells.iter().find(|c| c.source == "a").unwrap();
        let at_end = cells.iter().find(|c| c.source == "b").unwrap();
        assert!((before.position - 1.9).abs() < 1e-9);
        assert!((at_end.position - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn modify_cell_requires_existing_cell() {
        let store = MemoryStore::new();
        let tools = tools(&store);

        let err = tools
            .dispatch(
                &current_cell(),
                "modify_cell",
                &json!({"cellId": "ghost", "content": "x"}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn modify_cell_updates_source() {
        let store = MemoryStore::new();
        store.seed_cell(Cell::new("c1", CellType::Code, "old", 1.0)).await;
        let tools = tools(&store);

        tools
            .dispatch(&current_cell(), "modify_cell", &json!({"cellId": "c1", "content": "new"}))
            .await
            .unwrap();
        assert_eq!(cells(&store).await[0].source, "new");
    }

    #[tokio::test]
    async fn execute_cell_queues_with_ai_requester_and_bumped_count() {
        let store = MemoryStore::new();
        let mut cell = Cell::new("c1", CellType::Code, "1 + 1", 1.0);
        cell.execution_count = 4;
        store.seed_cell(cell).await;
        let tools = tools(&store);

        tools.dispatch(&current_cell(), "execute_cell", &json!({"cellId": "c1"})).await.unwrap();

        let pending = store
            .query(Selector::QueueByStatus { status: QueueStatus::Pending, assigned_session: None })
            .await
            .unwrap();
        let entry = pending[0].as_queue().unwrap();
        assert_eq!(entry.requested_by, "ai-assistant-sess-1");
        assert_eq!(entry.execution_count, 5);
        assert_eq!(entry.cell_id, "c1");
    }

    #[tokio::test]
    async fn execute_cell_rejects_non_code_cells() {
        let store = MemoryStore::new();
        store.seed_cell(Cell::new("m1", CellType::Markdown, "# hi", 1.0)).await;
        let tools = tools(&store);

        let err = tools
            .dispatch(&current_cell(), "execute_cell", &json!({"cellId": "m1"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Only code cells"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let store = MemoryStore::new();
        let tools = tools(&store);
        let err =
            tools.dispatch(&current_cell(), "drop_tables", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }
}
