//! Typed wrappers for the monitor verbs used by the backup orchestrator.

use anyhow::Error;
use serde_json::{json, Value};

use super::QmpClient;

/// Build a single transaction action object.
pub fn transaction_action(action: &str, data: Value) -> Value {
    json!({ "type": action, "data": data })
}

pub fn transaction_bitmap_add(node: &str, name: &str, persistent: bool) -> Value {
    transaction_action(
        "block-dirty-bitmap-add",
        json!({ "node": node, "name": name, "persistent": persistent }),
    )
}

pub fn transaction_bitmap_clear(node: &str, name: &str) -> Value {
    transaction_action(
        "block-dirty-bitmap-clear",
        json!({ "node": node, "name": name }),
    )
}

pub fn transaction_backup(args: Value) -> Value {
    transaction_action("blockdev-backup", args)
}

impl QmpClient {
    pub async fn query_block(&self) -> Result<Value, Error> {
        self.execute("query-block", None).await
    }

    pub async fn query_named_block_nodes(&self) -> Result<Value, Error> {
        self.execute("query-named-block-nodes", None).await
    }

    pub async fn query_block_jobs(&self) -> Result<Value, Error> {
        self.execute("query-block-jobs", None).await
    }

    pub async fn query_version(&self) -> Result<Value, Error> {
        self.execute("query-version", None).await
    }

    pub async fn query_name(&self) -> Result<Value, Error> {
        self.execute("query-name", None).await
    }

    pub async fn query_status(&self) -> Result<Value, Error> {
        self.execute("query-status", None).await
    }

    pub async fn bitmap_add(&self, node: &str, name: &str, persistent: bool) -> Result<(), Error> {
        self.execute(
            "block-dirty-bitmap-add",
            Some(json!({ "node": node, "name": name, "persistent": persistent })),
        )
        .await
        .map(|_| ())
    }

    pub async fn bitmap_remove(&self, node: &str, name: &str) -> Result<(), Error> {
        self.execute(
            "block-dirty-bitmap-remove",
            Some(json!({ "node": node, "name": name })),
        )
        .await
        .map(|_| ())
    }

    pub async fn bitmap_clear(&self, node: &str, name: &str) -> Result<(), Error> {
        self.execute(
            "block-dirty-bitmap-clear",
            Some(json!({ "node": node, "name": name })),
        )
        .await
        .map(|_| ())
    }

    pub async fn bitmap_disable(&self, node: &str, name: &str) -> Result<(), Error> {
        self.execute(
            "block-dirty-bitmap-disable",
            Some(json!({ "node": node, "name": name })),
        )
        .await
        .map(|_| ())
    }

    pub async fn bitmap_enable(&self, node: &str, name: &str) -> Result<(), Error> {
        self.execute(
            "block-dirty-bitmap-enable",
            Some(json!({ "node": node, "name": name })),
        )
        .await
        .map(|_| ())
    }

    pub async fn blockdev_add(&self, options: Value) -> Result<(), Error> {
        self.execute("blockdev-add", Some(options)).await.map(|_| ())
    }

    pub async fn blockdev_del(&self, node_name: &str) -> Result<(), Error> {
        self.execute("blockdev-del", Some(json!({ "node-name": node_name })))
            .await
            .map(|_| ())
    }

    /// Atomically reopen a set of nodes with new options. This is the only
    /// way to redirect in-flight guest I/O without racing the guest.
    pub async fn blockdev_reopen(&self, options: Vec<Value>) -> Result<(), Error> {
        self.execute("blockdev-reopen", Some(json!({ "options": options })))
            .await
            .map(|_| ())
    }

    pub async fn blockdev_backup(&self, args: Value) -> Result<(), Error> {
        self.execute("blockdev-backup", Some(args)).await.map(|_| ())
    }

    pub async fn block_job_cancel(&self, id: &str, force: bool) -> Result<(), Error> {
        self.execute(
            "block-job-cancel",
            Some(json!({ "device": id, "force": force })),
        )
        .await
        .map(|_| ())
    }

    pub async fn block_job_set_speed(&self, id: &str, speed: u64) -> Result<(), Error> {
        self.execute(
            "block-job-set-speed",
            Some(json!({ "device": id, "speed": speed })),
        )
        .await
        .map(|_| ())
    }

    /// Instruct a job started with `auto-finalize=false` to finalize. The
    /// orchestrator only issues this after observing the job in state
    /// `pending`, which guarantees the target has been durably flushed.
    pub async fn job_finalize(&self, id: &str) -> Result<(), Error> {
        self.execute("job-finalize", Some(json!({ "id": id })))
            .await
            .map(|_| ())
    }

    /// Execute a mixed sequence of atomic verbs; aborts as a whole on any
    /// single failure.
    pub async fn transaction(&self, actions: Vec<Value>) -> Result<(), Error> {
        self.execute("transaction", Some(json!({ "actions": actions })))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_transaction_action_shape() {
        let action = transaction_bitmap_add("disk1", "qmpbackup-disk1-abc", true);
        assert_eq!(action["type"], "block-dirty-bitmap-add");
        assert_eq!(action["data"]["node"], "disk1");
        assert_eq!(action["data"]["persistent"], true);

        let action = transaction_bitmap_clear("disk1", "qmpbackup-disk1-abc");
        assert_eq!(action["type"], "block-dirty-bitmap-clear");
        assert!(action["data"].get("persistent").is_none());
    }
}
