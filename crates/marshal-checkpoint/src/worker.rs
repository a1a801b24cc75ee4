use serde_json::{Value, json};
use std::io::{BufRead, Write};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::protocol::{CheckpointHandle, Operation, WorkerReply, WorkerRequest};
use crate::store::ObjectStore;

/// Executes checkpoint requests against an [`ObjectStore`]. Every request gets
/// exactly one reply carrying the request's id.
#[derive(Debug, Clone)]
pub struct CheckpointWorker {
    store: ObjectStore,
}

impl CheckpointWorker {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    pub fn handle(&self, request: WorkerRequest) -> WorkerReply {
        let id = request.id;
        match self.execute(request) {
            Ok(result) => WorkerReply::ok(id, result),
            Err(e) => {
                warn!(target: "marshal::checkpoint", request_id = id, error = %e, "checkpoint request failed");
                WorkerReply::failed(id, e.to_string())
            }
        }
    }

    fn execute(&self, request: WorkerRequest) -> StoreResult<Value> {
        match request.operation {
            Operation::Store => {
                let handle =
                    self.store
                        .store(&request.project_dir, &request.file_set, request.label)?;
                Ok(json!({ "checkpointHandle": handle }))
            }
            Operation::Restore => {
                let raw = request
                    .checkpoint_handle
                    .as_deref()
                    .ok_or(StoreError::MissingField("checkpointHandle"))?;
                let handle = CheckpointHandle::parse(raw)?;
                let summary = self
                    .store
                    .restore(&request.project_dir, &handle, &request.file_set)?;
                Ok(serde_json::to_value(summary)?)
            }
        }
    }

    /// Reads one JSON request per line and writes one JSON reply per line
    /// until the input closes.
    pub fn serve<R: BufRead, W: Write>(&self, reader: R, mut writer: W) -> std::io::Result<()> {
        for line in reader.lines() {
            let line = line?;
            let Some(reply) = self.handle_line(&line) else {
                continue;
            };
            serde_json::to_writer(&mut writer, &reply)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        debug!(target: "marshal::checkpoint", "request stream closed");
        Ok(())
    }

    /// Handles one raw request line. Malformed requests that still carry an id
    /// are answered with an error; ones without an id cannot be correlated and
    /// are dropped.
    pub fn handle_line(&self, line: &str) -> Option<WorkerReply> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match serde_json::from_str::<WorkerRequest>(line) {
            Ok(request) => Some(self.handle(request)),
            Err(e) => {
                let id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_u64));
                match id {
                    Some(id) => Some(WorkerReply::failed(id, format!("malformed request: {e}"))),
                    None => {
                        warn!(target: "marshal::checkpoint", error = %e, "dropping uncorrelatable request");
                        None
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn serve_answers_each_line_in_order() {
        let project = TempDir::new().expect("project");
        let store_dir = TempDir::new().expect("store");
        std::fs::write(project.path().join("a.txt"), "one").expect("write");
        let worker = CheckpointWorker::new(ObjectStore::new(store_dir.path()));

        let input = format!(
            "{}\n\n{}\n",
            json!({"id": 1, "operation": "store", "projectDir": project.path(), "fileSet": ["a.txt"]}),
            json!({"id": 2, "operation": "restore", "projectDir": project.path(), "fileSet": ["a.txt"]}),
        );
        let mut output = Vec::new();
        worker
            .serve(Cursor::new(input), &mut output)
            .expect("serve");

        let replies: Vec<WorkerReply> = String::from_utf8(output)
            .expect("utf8")
            .lines()
            .map(|l| serde_json::from_str(l).expect("reply"))
            .collect();
        assert_eq!(replies.len(), 2);
        assert!(replies[0].success);
        assert_eq!(replies[1].id, 2);
        assert!(!replies[1].success, "restore without a handle must fail");
    }

    #[test]
    fn malformed_line_with_id_gets_error_reply() {
        let store_dir = TempDir::new().expect("store");
        let worker = CheckpointWorker::new(ObjectStore::new(store_dir.path()));

        let reply = worker
            .handle_line(r#"{"id": 9, "operation": "explode"}"#)
            .expect("reply");
        assert_eq!(reply.id, 9);
        assert!(!reply.success);

        assert!(worker.handle_line("not json at all").is_none());
    }
}
