use super::token_for;
use convoy::client::ConvoyClient;
use convoy::protocol::{Event, MessageEntry, Request, Response, TaskFields, TaskStatus};
use convoy_fleet::task::Task;
use anyhow::{Result, bail};
use std::path::Path;

/// Convenience wrapper over `ConvoyClient` for integration tests.
pub struct TestClient {
    inner: ConvoyClient,
}

impl TestClient {
    /// Connect without authenticating.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let inner = ConvoyClient::connect(socket_path).await?;
        Ok(Self { inner })
    }

    /// Connect and authenticate as a test account.
    pub async fn connect_as(socket_path: &Path, account: &str) -> Result<Self> {
        let inner = ConvoyClient::connect_as(socket_path, account, &token_for(account)).await?;
        Ok(Self { inner })
    }

    pub fn inner(&mut self) -> &mut ConvoyClient {
        &mut self.inner
    }

    /// Send any request and return the raw reply.
    pub async fn call(&mut self, req: Request) -> Result<Response> {
        self.inner.call(req).await
    }

    pub async fn next_event(&mut self) -> Result<Event> {
        self.inner.next_event().await
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.inner.take_events()
    }

    pub async fn create_task(&mut self, title: &str) -> Result<Task> {
        self.create_task_with(title, TaskFields::default(), None).await
    }

    pub async fn create_task_with(
        &mut self,
        title: &str,
        fields: TaskFields,
        assignee: Option<&str>,
    ) -> Result<Task> {
        let data = self
            .inner
            .request(Request::CreateTask {
                title: title.to_string(),
                fields,
                assignee: assignee.map(str::to_string),
            })
            .await?;
        task_from(data)
    }

    pub async fn get_task(&mut self, task_id: &str) -> Result<Task> {
        let data = self
            .inner
            .request(Request::GetTask {
                task_id: task_id.to_string(),
            })
            .await?;
        task_from(data)
    }

    /// Change a task's status, returning the raw reply (including errors).
    pub async fn update_status(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        expected: Option<TaskStatus>,
        reason: Option<&str>,
        justification: Option<&str>,
    ) -> Result<Response> {
        self.inner
            .call(Request::UpdateTaskStatus {
                task_id: task_id.to_string(),
                status,
                expected_status: expected,
                reason: reason.map(str::to_string),
                justification: justification.map(str::to_string),
            })
            .await
    }

    /// Hand a task to `to`, returning the raw reply (including errors).
    pub async fn handoff(&mut self, task_id: &str, to: &str) -> Result<Response> {
        self.inner
            .call(Request::HandoffTask {
                to: to.to_string(),
                task_id: Some(task_id.to_string()),
                title: None,
                fields: TaskFields::default(),
            })
            .await
    }

    pub async fn send_message(&mut self, to: &str, body: &str) -> Result<String> {
        let data = self
            .inner
            .request(Request::SendMessage {
                to: to.to_string(),
                body: body.to_string(),
            })
            .await?;
        match data
            .as_ref()
            .and_then(|d| d.get("messageId"))
            .and_then(|v| v.as_str())
        {
            Some(id) => Ok(id.to_string()),
            None => bail!("send_message returned no messageId"),
        }
    }

    pub async fn read_messages(&mut self, unread_only: bool) -> Result<Vec<MessageEntry>> {
        match self
            .inner
            .request(Request::ReadMessages {
                unread_only,
                limit: None,
                mark_read: true,
            })
            .await?
        {
            Some(data) => Ok(serde_json::from_value(data)?),
            None => Ok(vec![]),
        }
    }

    pub async fn count_unread(&mut self) -> Result<u64> {
        let data = self.inner.request(Request::CountUnread).await?;
        match data.as_ref().and_then(|d| d.get("unread")).and_then(|v| v.as_u64()) {
            Some(n) => Ok(n),
            None => bail!("count_unread returned no count"),
        }
    }
}

fn task_from(data: Option<serde_json::Value>) -> Result<Task> {
    match data {
        Some(data) => Ok(serde_json::from_value(data)?),
        None => bail!("expected a task in the reply"),
    }
}
