//! Named operations for RPC-style front ends.
//!
//! Callers send a [`Command`] (typically decoded from JSON such as
//! `{"method": "pause", "params": {"ids": ["..."]}}`) and get a [`Reply`]
//! back. A panic inside a dispatched call is turned into
//! [`Error::Panic`] instead of unwinding into the caller.

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::error;

use super::config::StoreConfig;
use super::downloader::{Downloader, ResolveResult};
use super::task::{TaskFilter, TaskInfo};
use crate::error::{Error, Result};
use crate::fetcher::{Options, Request};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Command {
    Resolve {
        req: Request,
    },
    Create {
        rid: String,
        #[serde(default)]
        opts: Options,
    },
    CreateDirect {
        req: Request,
        #[serde(default)]
        opts: Options,
    },
    Pause(TaskFilter),
    Continue(TaskFilter),
    Delete {
        #[serde(default)]
        filter: TaskFilter,
        #[serde(default)]
        force: bool,
    },
    GetTask {
        id: String,
    },
    GetTasks(TaskFilter),
    Stats {
        id: String,
    },
    GetConfig,
    PutConfig(StoreConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Resolved(ResolveResult),
    TaskId(String),
    Task(Option<TaskInfo>),
    Tasks(Vec<TaskInfo>),
    Stats(Value),
    Config(StoreConfig),
    Empty,
}

pub async fn dispatch(downloader: &Downloader, command: Command) -> Result<Reply> {
    let name = command.name();
    match AssertUnwindSafe(execute(downloader, command))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!("command {} panicked: {}", name, message);
            Err(Error::Panic(message))
        }
    }
}

async fn execute(downloader: &Downloader, command: Command) -> Result<Reply> {
    match command {
        Command::Resolve { req } => downloader.resolve(req).await.map(Reply::Resolved),
        Command::Create { rid, opts } => downloader.create(&rid, opts).await.map(Reply::TaskId),
        Command::CreateDirect { req, opts } => {
            downloader.create_direct(req, opts).await.map(Reply::TaskId)
        }
        Command::Pause(filter) => downloader.pause(&filter).await.map(|_| Reply::Empty),
        Command::Continue(filter) => downloader.resume(&filter).await.map(|_| Reply::Empty),
        Command::Delete { filter, force } => downloader
            .delete(&filter, force)
            .await
            .map(|_| Reply::Empty),
        Command::GetTask { id } => Ok(Reply::Task(downloader.get_task(&id))),
        Command::GetTasks(filter) => Ok(Reply::Tasks(downloader.get_tasks_by_filter(&filter))),
        Command::Stats { id } => downloader.stats(&id).map(Reply::Stats),
        Command::GetConfig => Ok(Reply::Config(downloader.get_config())),
        Command::PutConfig(config) => downloader.put_config(config).map(|_| Reply::Empty),
    }
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Resolve { .. } => "resolve",
            Command::Create { .. } => "create",
            Command::CreateDirect { .. } => "createDirect",
            Command::Pause(_) => "pause",
            Command::Continue(_) => "continue",
            Command::Delete { .. } => "delete",
            Command::GetTask { .. } => "getTask",
            Command::GetTasks(_) => "getTasks",
            Command::Stats { .. } => "stats",
            Command::GetConfig => "getConfig",
            Command::PutConfig(_) => "putConfig",
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_commands() {
        let cmd: Command = serde_json::from_value(json!({
            "method": "pause",
            "params": {"ids": ["a", "b"]}
        }))
        .unwrap();
        assert!(matches!(cmd, Command::Pause(ref f) if f.ids == vec!["a", "b"]));

        let cmd: Command = serde_json::from_value(json!({
            "method": "delete",
            "params": {"filter": {"statuses": ["done"]}, "force": true}
        }))
        .unwrap();
        assert_eq!(cmd.name(), "delete");
        assert!(matches!(cmd, Command::Delete { force: true, .. }));

        let cmd: Command = serde_json::from_value(json!({"method": "getConfig"})).unwrap();
        assert!(matches!(cmd, Command::GetConfig));
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let result = serde_json::from_value::<Command>(json!({"method": "explode"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
