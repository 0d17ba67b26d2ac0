//! AI reply bridge. `AI_MESSAGE` submits a job to a bounded queue drained
//! by a dedicated worker thread; the requester gets nothing but the
//! automatic ACK, and the generated text re-enters the system as a normal
//! `MESSAGE` broadcast authored by the assistant user. A full queue
//! rejects the job (drop + log); generator failures are logged and
//! swallowed.

use std::fmt::Write as _;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use banter_db::models::{MessageView, UserRow};
use banter_gateway::Gateway;
use banter_types::{MemberInfo, ServerPayload};

use crate::messages;
use crate::router::bump;

/// In-flight + queued jobs the bridge will hold before rejecting.
const QUEUE_DEPTH: usize = 4;

/// Per-request timeout for the generation HTTP call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The designated assistant account. Created on first use, auto-joined to
/// any room it is asked to speak in.
const ASSISTANT_EMAIL: &str = "assistant@banter.local";
const ASSISTANT_NAME: &str = "Assistant";

pub struct AiJob {
    pub room_db_id: i64,
    pub room_public_id: String,
    pub requester_name: String,
    pub seed: Option<String>,
}

/// Text-generation backends. All of them are a pure `prompt -> text` call
/// from the server's point of view.
pub enum AiBackend {
    OpenAi {
        client: reqwest::blocking::Client,
        api_key: String,
        model: String,
    },
    Ollama {
        client: reqwest::blocking::Client,
        base_url: String,
        model: String,
    },
    Disabled,
}

impl AiBackend {
    pub fn openai(api_key: String, model: String) -> Result<Self> {
        Ok(Self::OpenAi {
            client: reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()?,
            api_key,
            model,
        })
    }

    pub fn ollama(base_url: String, model: String) -> Result<Self> {
        Ok(Self::Ollama {
            client: reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()?,
            base_url,
            model,
        })
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }

    fn generate(&self, prompt: &str) -> Result<String> {
        match self {
            Self::OpenAi {
                client,
                api_key,
                model,
            } => {
                let body = json!({
                    "model": model,
                    "messages": [{"role": "user", "content": prompt}],
                });
                let response: serde_json::Value = client
                    .post("https://api.openai.com/v1/chat/completions")
                    .bearer_auth(api_key)
                    .json(&body)
                    .send()?
                    .error_for_status()?
                    .json()?;
                let text = response["choices"][0]["message"]["content"]
                    .as_str()
                    .context("completion response carries no content")?;
                Ok(trim_reply(text))
            }
            Self::Ollama {
                client,
                base_url,
                model,
            } => {
                let body = json!({
                    "model": model,
                    "stream": false,
                    "messages": [{"role": "user", "content": prompt}],
                });
                let response: serde_json::Value = client
                    .post(format!("{}/api/chat", base_url.trim_end_matches('/')))
                    .json(&body)
                    .send()?
                    .error_for_status()?
                    .json()?;
                let text = response["message"]["content"]
                    .as_str()
                    .context("chat response carries no content")?;
                Ok(trim_reply(text))
            }
            Self::Disabled => anyhow::bail!("AI backend is disabled"),
        }
    }
}

/// Models sometimes wrap replies in quotes; strip them.
fn trim_reply(text: &str) -> String {
    text.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_string()
}

/// Handle side of the bridge. Cheap to clone into the router.
#[derive(Clone)]
pub struct AiBridge {
    tx: Option<Sender<AiJob>>,
}

impl AiBridge {
    /// Bridge that rejects everything; used when `AI_BACKEND=none`.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Spawn the worker thread and return the submit handle. The worker
    /// exits when every handle is dropped.
    pub fn start(
        gateway: Arc<Gateway>,
        backend: AiBackend,
        context_messages: u32,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = bounded(QUEUE_DEPTH);
        let handle = std::thread::Builder::new()
            .name("banter-ai".to_string())
            .spawn(move || worker(gateway, backend, context_messages, rx))
            .expect("failed to spawn AI worker");
        (Self { tx: Some(tx) }, handle)
    }

    pub fn enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Non-blocking submit; `false` when the pool is saturated or disabled.
    pub fn submit(&self, job: AiJob) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(job).is_ok(),
            None => false,
        }
    }
}

/// `AI_MESSAGE` handler: membership is required, the submission is
/// fire-and-forget, and saturation is back-pressure by rejection.
pub fn request(
    gateway: &Gateway,
    bridge: &AiBridge,
    user: &UserRow,
    room_id: &str,
    seed: Option<&str>,
) -> Result<Option<ServerPayload>> {
    let Some(room) = crate::rooms::lookup(gateway, room_id)? else {
        return Ok(Some(crate::rooms::room_not_found()));
    };
    if gateway.db.member(room.id, user.id)?.is_none() {
        return Ok(Some(ServerPayload::Error {
            message: "You must join the room to request AI messages".to_string(),
        }));
    }
    if !bridge.enabled() {
        return Ok(Some(ServerPayload::Error {
            message: "AI replies are not enabled".to_string(),
        }));
    }

    bump(&gateway.metrics.ai_requests);
    let accepted = bridge.submit(AiJob {
        room_db_id: room.id,
        room_public_id: room.room_id.clone(),
        requester_name: user.name.clone(),
        seed: seed.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
    });
    if !accepted {
        bump(&gateway.metrics.ai_rejections);
        warn!(room = %room.room_id, "AI queue saturated, request dropped");
    }
    Ok(None)
}

fn worker(gateway: Arc<Gateway>, backend: AiBackend, context_messages: u32, rx: Receiver<AiJob>) {
    info!("AI worker started");
    while let Ok(job) = rx.recv() {
        if let Err(e) = run_job(&gateway, &backend, context_messages, &job) {
            bump(&gateway.metrics.ai_failures);
            warn!(room = %job.room_public_id, error = %e, "AI generation failed");
        }
    }
    info!("AI worker stopped");
}

fn run_job(
    gateway: &Gateway,
    backend: &AiBackend,
    context_messages: u32,
    job: &AiJob,
) -> Result<()> {
    let history = gateway.db.recent_messages(job.room_db_id, context_messages)?;
    let prompt = build_prompt(&history, &job.requester_name, job.seed.as_deref());

    let reply = backend.generate(&prompt)?;
    if reply.is_empty() {
        anyhow::bail!("generator returned an empty reply");
    }

    let assistant = ensure_assistant(gateway)?;
    // Auto-join on first use so the reply lands like any member's message.
    if gateway.db.add_member(job.room_db_id, assistant.id, false)? {
        let joined_at = gateway
            .db
            .member(job.room_db_id, assistant.id)?
            .map(|m| m.joined_at)
            .unwrap_or_default();
        gateway.broadcast_to_room(
            job.room_db_id,
            &ServerPayload::MemberJoined {
                room_id: job.room_public_id.clone(),
                member: MemberInfo {
                    user_id: assistant.user_id.clone(),
                    name: assistant.name.clone(),
                    is_admin: false,
                    joined_at,
                },
            },
        )?;
    }

    messages::append_and_broadcast(
        gateway,
        job.room_db_id,
        &job.room_public_id,
        &assistant,
        &reply,
        true,
    )?;
    Ok(())
}

fn ensure_assistant(gateway: &Gateway) -> Result<UserRow> {
    if let Some(user) = gateway.db.user_by_email(ASSISTANT_EMAIL)? {
        return Ok(user);
    }
    let user_id = Uuid::new_v4().simple().to_string();
    match gateway
        .db
        .create_user(&user_id, ASSISTANT_NAME, ASSISTANT_EMAIL, None)
    {
        Ok(user) => Ok(user),
        Err(e) if banter_db::is_constraint_violation(&e) => gateway
            .db
            .user_by_email(ASSISTANT_EMAIL)?
            .context("assistant row vanished after conflict"),
        Err(e) => Err(e),
    }
}

/// One flat prompt: persona line, recent history oldest-first, then the
/// task — continue the conversation, or improve the seed message.
fn build_prompt(history: &[MessageView], requester: &str, seed: Option<&str>) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "You are participating in a group chat. Your goal is to respond as if \
         you are '{}', using a casual, human-like, friendly tone.",
        requester
    );
    for message in history {
        let _ = writeln!(prompt, "{}: {}", message.sender_name, message.content);
    }
    match seed {
        Some(content) => {
            let _ = write!(
                prompt,
                "As {}, you're planning to send this message: '{}'. Improve it to \
                 make it sound more natural, accurate, and casual in this group \
                 chat context.",
                requester, content
            );
        }
        None => {
            let _ = write!(
                prompt,
                "Continue the chat as if you are {}. Craft the next message that \
                 fits naturally into the conversation. Do not mention the name of \
                 the user you are pretending to be. Do not use long paragraphs, \
                 lists, or formal language. Do not introduce yourself or sign \
                 messages. Do not put your answer in quotes or brackets.",
                requester
            );
        }
    }
    prompt
}
