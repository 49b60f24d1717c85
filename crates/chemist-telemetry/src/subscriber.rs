//! Telemetry fan-in.
//!
//! One reader task per Active flask, opened when the repository reports a
//! flask arriving and closed when it terminates. Key messages are diffed
//! against the flask's known set; error messages and broken connections go
//! to the investigation channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chemist_state::{ChangeNotification, Flask, FlaskId, FlaskState, Key, Names, Repository};

use crate::wire::{decode_telemetry, read_frame, Telemetry};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A key seen for the first time in a flask's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewKey {
    pub flask: FlaskId,
    pub key: Key,
}

/// Maintains one telemetry subscription per Active flask.
pub struct Subscriber {
    repo: Arc<Repository>,
    new_keys_tx: mpsc::Sender<NewKey>,
    suspects_tx: mpsc::Sender<Names>,
    readers: Mutex<HashMap<FlaskId, JoinHandle<()>>>,
}

impl Subscriber {
    pub fn new(
        repo: Arc<Repository>,
        new_keys_tx: mpsc::Sender<NewKey>,
        suspects_tx: mpsc::Sender<Names>,
    ) -> Self {
        Self {
            repo,
            new_keys_tx,
            suspects_tx,
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// Watch repository changes and keep the reader set in sync with the
    /// Active fleet. Runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.repo.subscribe_changes();

        // Catch up with flasks registered before we subscribed.
        for flask in self.repo.active_flasks().await {
            self.ensure_reader(flask, shutdown.clone()).await;
        }
        info!("telemetry subscriber started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                change = changes.recv() => match change {
                    Ok(ChangeNotification::FlaskRegistered(id))
                    | Ok(ChangeNotification::FlaskStateChanged(id, FlaskState::Active)) => {
                        if let Some(flask) = self.repo.flask(&id).await {
                            self.ensure_reader(flask, shutdown.clone()).await;
                        }
                    }
                    Ok(ChangeNotification::FlaskStateChanged(id, FlaskState::Terminated)) => {
                        self.drop_reader(&id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "change stream lagged, resyncing readers");
                        for flask in self.repo.active_flasks().await {
                            self.ensure_reader(flask, shutdown.clone()).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        let mut readers = self.readers.lock().await;
        for (_, handle) in readers.drain() {
            handle.abort();
        }
        info!("telemetry subscriber stopped");
    }

    async fn ensure_reader(&self, flask: Flask, shutdown: watch::Receiver<bool>) {
        let mut readers = self.readers.lock().await;
        if let Some(existing) = readers.get(&flask.id) {
            if !existing.is_finished() {
                return;
            }
        }
        let id = flask.id.clone();
        let handle = tokio::spawn(read_loop(
            flask,
            self.new_keys_tx.clone(),
            self.suspects_tx.clone(),
            self.repo.clone(),
            shutdown,
        ));
        if let Some(old) = readers.insert(id, handle) {
            old.abort();
        }
    }

    async fn drop_reader(&self, id: &str) {
        let mut readers = self.readers.lock().await;
        if let Some(handle) = readers.remove(id) {
            handle.abort();
            debug!(flask = %id, "telemetry reader closed");
        }
    }

    /// Flask ids with a live reader.
    pub async fn active_readers(&self) -> Vec<FlaskId> {
        let readers = self.readers.lock().await;
        readers
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Blocking read loop over one flask's telemetry socket.
async fn read_loop(
    flask: Flask,
    new_keys_tx: mpsc::Sender<NewKey>,
    suspects_tx: mpsc::Sender<Names>,
    repo: Arc<Repository>,
    mut shutdown: watch::Receiver<bool>,
) {
    let address = (flask.location.host.as_str(), flask.location.port);
    let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await;

    let mut stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(flask = %flask.id, error = %e, "telemetry connect failed");
            suspect(&suspects_tx, &flask.id, "connect").await;
            return;
        }
        Err(_) => {
            warn!(flask = %flask.id, "telemetry connect timed out");
            suspect(&suspects_tx, &flask.id, "connect").await;
            return;
        }
    };

    debug!(flask = %flask.id, "telemetry subscription open");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut stream) => {
                match frame {
                    Ok(frame) => match decode_telemetry(&frame) {
                        Ok(Telemetry::Key(key)) => {
                            if repo.record_key(&flask.id, key.clone()).await {
                                let _ = new_keys_tx
                                    .send(NewKey { flask: flask.id.clone(), key })
                                    .await;
                            }
                        }
                        Ok(Telemetry::Error(names)) => {
                            let _ = suspects_tx.send(names).await;
                        }
                        Ok(Telemetry::Unknown { topic }) => {
                            debug!(flask = %flask.id, ?topic, "ignoring telemetry topic");
                        }
                        Err(e) => {
                            // Bad payload on a healthy framing layer: drop it.
                            warn!(flask = %flask.id, error = %e, "undecodable telemetry message");
                        }
                    },
                    Err(e) => {
                        // Framing or socket failure: the stream is done for.
                        warn!(flask = %flask.id, error = %e, "telemetry stream broken");
                        suspect(&suspects_tx, &flask.id, "stream").await;
                        break;
                    }
                }
            }
        }
    }
}

async fn suspect(suspects_tx: &mpsc::Sender<Names>, flask_id: &str, kind: &str) {
    let _ = suspects_tx
        .send(Names {
            mine: flask_id.to_string(),
            kind: kind.to_string(),
            theirs: String::new(),
        })
        .await;
}
