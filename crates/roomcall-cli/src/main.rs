//! # roomcall
//!
//! Runs a two-party call in one room over the in-process signaling hub and
//! the loopback media engine, printing every state transition of both sides.
//! Handy for watching the negotiation with `RUST_LOG=roomcall=debug`.

use anyhow::Context;
use clap::Parser;
use futures_util::StreamExt;
use roomcall_common::{RoomId, UserId};
use roomcall_rtc::media::loopback::LoopbackEngineFactory;
use roomcall_rtc::transport::memory::MemoryHub;
use roomcall_rtc::{CallManager, SessionEvent, SessionHandle, SessionState};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "roomcall", version, about = "Run a demo call between two in-process peers")]
struct Args {
    /// Room both peers join
    #[arg(long, default_value = "ABCDEF")]
    room: String,

    #[arg(long, default_value = "alice")]
    caller: String,

    #[arg(long, default_value = "bob")]
    callee: String,

    /// Address the offer to the callee instead of the whole room
    #[arg(long)]
    direct: bool,

    /// Request video as well as audio
    #[arg(long)]
    video: bool,

    /// Start the caller with its microphone muted
    #[arg(long)]
    muted: bool,

    /// Leave the incoming call waiting and answer it explicitly
    #[arg(long)]
    manual_answer: bool,

    /// Give up if the call is not connected after this many seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "roomcall=debug,roomcall_rtc=debug".into());
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    tracing::info!("Starting roomcall v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = roomcall_common::config::init()
        .context("loading configuration")?
        .clone();

    if args.video {
        config.media.video = true;
    }
    if args.manual_answer {
        config.call.auto_answer = false;
    }

    let hub = MemoryHub::new();
    let engines = LoopbackEngineFactory::new();
    let room = RoomId::new(args.room);
    let caller_id = UserId::new(args.caller);
    let callee_id = UserId::new(args.callee);
    let deadline = Duration::from_secs(args.timeout_secs);

    let (caller, _) = CallManager::new(
        caller_id.clone(),
        Arc::new(hub.connect(caller_id.clone())),
        Arc::new(engines.clone()),
        config.clone(),
    );
    let (callee, mut incoming) = CallManager::new(
        callee_id.clone(),
        Arc::new(hub.connect(callee_id.clone())),
        Arc::new(engines),
        config,
    );

    callee.join_room(&room).await?;
    let outgoing = if args.direct {
        caller.call_user(&room, callee_id.clone()).await?
    } else {
        caller.start_call(&room).await?
    };
    if args.muted {
        caller.set_muted(&outgoing, true).await?;
    }
    let caller_log = tokio::spawn(print_events(caller_id.clone(), outgoing.clone()));

    let answered = tokio::time::timeout(deadline, incoming.next())
        .await
        .context("no incoming call arrived")?
        .context("callee stopped listening")?;
    let callee_log = tokio::spawn(print_events(callee_id.clone(), answered.clone()));

    if !callee.config().call.auto_answer {
        callee.answer_incoming(&answered).await?;
    }

    let (outgoing_state, answered_state) = tokio::time::timeout(deadline, async {
        tokio::join!(
            outgoing.wait_for_state(SessionState::Connected),
            answered.wait_for_state(SessionState::Connected)
        )
    })
    .await
    .context("call did not connect in time")?;
    if outgoing_state.is_none() || answered_state.is_none() {
        anyhow::bail!("call ended before connecting");
    }

    println!(
        "{caller_id} <-> {callee_id} connected in room {room} (caller audio: {})",
        if outgoing.snapshot().audio_enabled { "on" } else { "muted" }
    );

    caller.end_call(&outgoing).await;
    callee.end_call(&answered).await;
    let _ = tokio::join!(caller_log, callee_log);

    Ok(())
}

/// Print a session's events until it closes.
async fn print_events(who: UserId, handle: SessionHandle) {
    let Some(mut events) = handle.events() else {
        return;
    };
    while let Some(event) = events.next().await {
        match event {
            SessionEvent::StateChanged { from, to } => println!("[{who}] {from} -> {to}"),
            SessionEvent::RemoteMedia(source) => println!(
                "[{who}] remote media {} (audio: {}, video: {})",
                source.id, source.audio, source.video
            ),
        }
    }
}
