//! Runs the router on one dedicated thread.
//!
//! Every action, and the redraw it triggers, completes before the next
//! command is taken off the channel, so the scene never sees two mutators.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::error::{Result, ViewerError};
use crate::router::{RemoteAction, RemoteActionRouter};

pub enum SceneCommand {
    Dispatch {
        action: RemoteAction,
        reply: oneshot::Sender<Result<Value>>,
    },
}

/// Cloneable sender side used by connections.
#[derive(Clone)]
pub struct SceneHandle {
    commands: mpsc::Sender<SceneCommand>,
}

impl SceneHandle {
    /// Queue `action` and wait for the router's response.
    ///
    /// # Errors
    ///
    /// `FatalResource` when the actor has stopped or the action failed fatally.
    pub async fn dispatch(&self, action: RemoteAction) -> Result<Value> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SceneCommand::Dispatch { action, reply })
            .map_err(|_| ViewerError::FatalResource("render actor is not running".into()))?;
        response
            .await
            .map_err(|_| ViewerError::FatalResource("render actor dropped the request".into()))?
    }
}

pub struct RenderActor {
    thread: JoinHandle<Result<()>>,
}

impl RenderActor {
    /// Move `router` onto its own thread. An initial frame is rendered before
    /// any command is processed.
    pub fn spawn(router: RemoteActionRouter) -> Result<(Self, SceneHandle)> {
        let (commands, inbox) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("render-actor".into())
            .spawn(move || run(router, inbox))?;
        Ok((Self { thread }, SceneHandle { commands }))
    }

    /// Block until the actor exits, which happens once every handle is
    /// dropped or after a fatal failure.
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| ViewerError::FatalResource("render actor panicked".into()))?
    }
}

fn run(mut router: RemoteActionRouter, inbox: mpsc::Receiver<SceneCommand>) -> Result<()> {
    router.redraw()?;
    info!("render actor started");

    for command in inbox {
        match command {
            SceneCommand::Dispatch { action, reply } => match router.dispatch(action) {
                Ok(response) => {
                    let _ = reply.send(Ok(response));
                }
                Err(err) => {
                    error!(%err, "render actor stopping");
                    let message = err.to_string();
                    let _ = reply.send(Err(err));
                    return Err(ViewerError::FatalResource(message));
                }
            },
        }
    }

    info!("render actor stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::cpu::CpuRayCaster;
    use crate::scene::{Frame, SceneConfig, SceneHost};
    use crate::volume_source::VolumeSource;
    use serde_json::json;
    use std::sync::Arc;

    fn spawn() -> (RenderActor, SceneHandle, mpsc::Receiver<Frame>) {
        let (frames, received) = mpsc::channel();
        let host = SceneHost::new(
            Box::new(CpuRayCaster),
            SceneConfig {
                width: 2,
                height: 2,
                ..SceneConfig::default()
            },
        );
        let source = Arc::new(VolumeSource::dicom(Default::default()));
        let router = RemoteActionRouter::new(source, host, Box::new(frames));
        let (actor, handle) = RenderActor::spawn(router).unwrap();
        (actor, handle, received)
    }

    #[tokio::test]
    async fn dispatches_in_order_and_stops_with_last_handle() {
        let (actor, handle, frames) = spawn();
        let cleared = handle.dispatch(RemoteAction::ClearRender).await.unwrap();
        assert_eq!(cleared, json!({"status": "cleared"}));
        let missing = handle
            .dispatch(RemoteAction::StartRender {
                dicom_dir: "/definitely/not/here".into(),
            })
            .await
            .unwrap();
        assert_eq!(missing["kind"], "source_not_found");

        drop(handle);
        actor.join().unwrap();
        // initial frame plus the clear
        assert_eq!(frames.try_iter().count(), 2);
    }
}
