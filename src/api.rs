use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::entity::{Channel, ImLink, User, Watermark};
use crate::remote::{
    FileUpload, HistoryPage, HistoryQuery, InviteOutcome, PinnedItem, RemoteApi, RemoteFile,
    RoomKind, UnreadCounts,
};
use crate::wire::{
    WireChannel, WireCounts, WireFile, WireHistory, WireIm, WirePin, WireStart, WireUser, groups,
};

pub const DEFAULT_BASE_URL: &str = "https://slack.com/api";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected status: {0}")]
    Status(u16),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("api error: {error} ({description})")]
    Api { error: String, description: String },
}

impl ApiError {
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Api { error, .. } => Some(error),
            _ => None,
        }
    }
}

type Params = Vec<(&'static str, String)>;

/// Web API client. Every call is a form post carrying the bearer token.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    token: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http: Client::new(),
        }
    }

    /// Opens a real-time session: the socket URL plus the workspace snapshot.
    pub async fn start_realtime(&self) -> Result<WireStart, ApiError> {
        let body = self.post_with_token("rtm.start", &Vec::new()).await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn auth_test(&self) -> Result<String, ApiError> {
        let body = self.post_with_token("auth.test", &Vec::new()).await?;
        Ok(body
            .get("user")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn post_with_token(&self, method: &str, params: &Params) -> Result<Value, ApiError> {
        let url = format!("{}/{}", self.base_url, method);
        tracing::debug!(%method, "api call");
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .form(params)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        check(response.json().await?)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &Params,
        field: &str,
    ) -> Result<T, ApiError> {
        let mut body = self.post_with_token(method, params).await?;
        take_field(&mut body, field)
    }
}

fn check(body: Value) -> Result<Value, ApiError> {
    if body.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(body);
    }
    let error = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error")
        .to_string();
    Err(ApiError::Api {
        description: describe_error(&error).to_string(),
        error,
    })
}

fn take_field<T: DeserializeOwned>(body: &mut Value, field: &str) -> Result<T, ApiError> {
    let value = body.get_mut(field).map(Value::take).unwrap_or(Value::Null);
    Ok(serde_json::from_value(value)?)
}

fn describe_error(code: &str) -> &'static str {
    match code {
        "not_authed" => "No token provided",
        "invalid_auth" | "token_revoked" | "account_inactive" => "Token rejected",
        "ratelimited" => "Rate limited",
        "channel_not_found" => "Room not found",
        "user_not_found" => "User not found",
        "not_in_channel" => "Not a member of this room",
        "is_archived" => "Room is archived",
        "cant_invite_self" => "Can not invite yourself",
        "already_in_channel" => "User already in room",
        "msg_too_long" => "Message too long",
        "no_text" => "Message is empty",
        _ => "Unknown error",
    }
}

fn history_params(room: &str, query: &HistoryQuery) -> Params {
    let mut params = vec![("channel", room.to_string())];
    if !query.oldest.is_empty() {
        params.push(("oldest", query.oldest.to_string()));
    }
    if !query.latest.is_empty() {
        params.push(("latest", query.latest.to_string()));
    }
    if let Some(count) = query.count {
        params.push(("count", count.to_string()));
    }
    if query.inclusive {
        params.push(("inclusive", "1".to_string()));
    }
    params
}

fn invite_outcome(result: Result<Value, ApiError>) -> Result<InviteOutcome, ApiError> {
    match result {
        Ok(body) if body.get("already_in_group").and_then(Value::as_bool) == Some(true) => {
            Ok(InviteOutcome::AlreadyMember)
        }
        Ok(_) => Ok(InviteOutcome::Invited),
        Err(error) if error.code() == Some("already_in_channel") => Ok(InviteOutcome::AlreadyMember),
        Err(error) => Err(error),
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn fetch_users(&self) -> Result<Vec<User>, ApiError> {
        let params = vec![("presence", "1".to_string())];
        let users: Vec<WireUser> = self.fetch("users.list", &params, "members").await?;
        Ok(users.into_iter().map(User::from).collect())
    }

    async fn fetch_channels(&self) -> Result<Vec<Channel>, ApiError> {
        let channels: Vec<WireChannel> = self.fetch("channels.list", &Vec::new(), "channels").await?;
        Ok(channels.into_iter().map(Channel::from).collect())
    }

    async fn fetch_groups(&self) -> Result<Vec<Channel>, ApiError> {
        let wire: Vec<WireChannel> = self.fetch("groups.list", &Vec::new(), "groups").await?;
        Ok(groups(wire))
    }

    async fn fetch_ims(&self) -> Result<Vec<ImLink>, ApiError> {
        let ims: Vec<WireIm> = self.fetch("im.list", &Vec::new(), "ims").await?;
        Ok(ims.into_iter().map(ImLink::from).collect())
    }

    async fn fetch_counts(&self) -> Result<UnreadCounts, ApiError> {
        let body = self.post_with_token("users.counts", &Vec::new()).await?;
        let counts: WireCounts = serde_json::from_value(body)?;
        Ok(counts.into())
    }

    async fn history(
        &self,
        kind: RoomKind,
        room: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, ApiError> {
        let method = format!("{}.history", kind.family());
        let body = self.post_with_token(&method, &history_params(room, query)).await?;
        let page: WireHistory = serde_json::from_value(body)?;
        Ok(page.into())
    }

    async fn post_message(&self, room: &str, text: &str) -> Result<(), ApiError> {
        let params = vec![
            ("channel", room.to_string()),
            ("text", text.to_string()),
            ("as_user", "true".to_string()),
        ];
        self.post_with_token("chat.postMessage", &params).await?;
        Ok(())
    }

    async fn set_read_marker(
        &self,
        kind: RoomKind,
        room: &str,
        at: &Watermark,
    ) -> Result<(), ApiError> {
        let method = format!("{}.mark", kind.family());
        let params = vec![("channel", room.to_string()), ("ts", at.to_string())];
        self.post_with_token(&method, &params).await?;
        Ok(())
    }

    async fn list_pins(&self, room: &str) -> Result<Vec<PinnedItem>, ApiError> {
        let params = vec![("channel", room.to_string())];
        let pins: Vec<WirePin> = self.fetch("pins.list", &params, "items").await?;
        Ok(pins.into_iter().filter_map(WirePin::into_item).collect())
    }

    async fn list_files(&self, room: &str) -> Result<Vec<RemoteFile>, ApiError> {
        let params = vec![("channel", room.to_string())];
        let files: Vec<WireFile> = self.fetch("files.list", &params, "files").await?;
        Ok(files.into_iter().map(RemoteFile::from).collect())
    }

    async fn upload_file(&self, upload: &FileUpload) -> Result<RemoteFile, ApiError> {
        let url = format!("{}/files.upload", self.base_url);
        let bytes = tokio::fs::read(&upload.path).await?;
        let file_name = upload
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime = mime_guess::from_path(&upload.path).first_or_octet_stream();

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str(mime.essence_str())?;
        let mut form = reqwest::multipart::Form::new()
            .text("channels", upload.room.clone())
            .text("filename", file_name)
            .part("file", part);
        if let Some(title) = &upload.title {
            form = form.text("title", title.clone());
        }
        if let Some(comment) = &upload.comment {
            form = form.text("initial_comment", comment.clone());
        }

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        let mut body = check(response.json().await?)?;
        let file: WireFile = take_field(&mut body, "file")?;
        Ok(file.into())
    }

    async fn join_channel(&self, name: &str) -> Result<(), ApiError> {
        let params = vec![("name", name.to_string())];
        self.post_with_token("channels.join", &params).await?;
        Ok(())
    }

    async fn leave(&self, kind: RoomKind, room: &str) -> Result<(), ApiError> {
        let method = match kind {
            RoomKind::Im => "im.close".to_string(),
            _ => format!("{}.leave", kind.family()),
        };
        let params = vec![("channel", room.to_string())];
        self.post_with_token(&method, &params).await?;
        Ok(())
    }

    async fn invite(
        &self,
        kind: RoomKind,
        room: &str,
        user: &str,
    ) -> Result<InviteOutcome, ApiError> {
        let method = format!("{}.invite", kind.family());
        let params = vec![("channel", room.to_string()), ("user", user.to_string())];
        invite_outcome(self.post_with_token(&method, &params).await)
    }
}
