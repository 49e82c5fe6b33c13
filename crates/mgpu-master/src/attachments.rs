//! Interactive client attachments: the master's retained sockets for
//! streaming output back to `submit --interactive` clients.

use std::collections::HashMap;

use mgpu_proto::{JobId, StreamEvent};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::debug;

/// One attached client's writable half, an owning reference that the
/// socket itself never references back — avoiding the cyclic
/// master/socket reference the original implementation had.
pub struct Attachment {
    writer: OwnedWriteHalf,
}

impl Attachment {
    /// Wrap a connected client's write half as an attachment.
    #[must_use]
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self { writer }
    }

    async fn write_event(&mut self, event: &StreamEvent) -> std::io::Result<()> {
        let mut buf = serde_json::to_vec(event).unwrap_or_default();
        buf.push(b'\n');
        self.writer.write_all(&buf).await?;
        self.writer.flush().await
    }
}

/// `job_id → attached client sockets`, present only while the job is
/// queued or running and the client's socket is still alive.
#[derive(Default)]
pub struct AttachmentTable {
    attachments: HashMap<JobId, Vec<Attachment>>,
}

impl AttachmentTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attachments: HashMap::new(),
        }
    }

    /// Attach a new client socket to a job.
    pub fn attach(&mut self, job_id: JobId, writer: OwnedWriteHalf) {
        self.attachments
            .entry(job_id)
            .or_default()
            .push(Attachment::new(writer));
    }

    /// Whether any client is attached to `job_id`.
    #[must_use]
    pub fn has_attachments(&self, job_id: JobId) -> bool {
        self.attachments
            .get(&job_id)
            .is_some_and(|v| !v.is_empty())
    }

    /// Forward an output line to every surviving attachment for a job.
    /// Sockets whose write fails are dropped from the attachment set;
    /// the job itself is unaffected.
    pub async fn forward_output(&mut self, job_id: JobId, data: String) {
        let Some(attached) = self.attachments.get_mut(&job_id) else {
            return;
        };
        let event = StreamEvent::Output { data };
        let mut i = 0;
        while i < attached.len() {
            if attached[i].write_event(&event).await.is_err() {
                debug!(job_id = %job_id, "interactive attachment write failed, dropping");
                attached.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Send a terminal completion event to every surviving attachment,
    /// then drop them, closing their sockets.
    pub async fn complete(&mut self, job_id: JobId, exit_code: i32) {
        if let Some(mut attached) = self.attachments.remove(&job_id) {
            let event = StreamEvent::Completion { exit_code };
            for attachment in &mut attached {
                let _ = attachment.write_event(&event).await;
            }
        }
    }

    /// Send a terminal error event to every surviving attachment (e.g.
    /// dispatch/placement failure), then drop them.
    pub async fn fail(&mut self, job_id: JobId, message: String) {
        if let Some(mut attached) = self.attachments.remove(&job_id) {
            let event = StreamEvent::Error { message };
            for attachment in &mut attached {
                let _ = attachment.write_event(&event).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (OwnedWriteHalf, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        let (_read, write) = server.into_split();
        (write, client)
    }

    #[tokio::test]
    async fn forward_output_delivers_event_to_attached_client() {
        let (writer, mut client) = connected_pair().await;
        let mut table = AttachmentTable::new();
        let job_id = JobId::new();
        table.attach(job_id, writer);
        table.forward_output(job_id, "hello".to_string()).await;

        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut reader = BufReader::new(&mut client);
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read");
        assert_eq!(line.trim_end(), r#"{"type":"output","data":"hello"}"#);
    }

    #[tokio::test]
    async fn complete_sends_completion_and_removes_attachment() {
        let (writer, mut client) = connected_pair().await;
        let mut table = AttachmentTable::new();
        let job_id = JobId::new();
        table.attach(job_id, writer);
        table.complete(job_id, 0).await;
        assert!(!table.has_attachments(job_id));

        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut reader = BufReader::new(&mut client);
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read");
        assert_eq!(line.trim_end(), r#"{"type":"completion","exit_code":0}"#);
    }

    #[tokio::test]
    async fn dead_socket_is_dropped_without_affecting_table() {
        let (writer, client) = connected_pair().await;
        drop(client);
        let mut table = AttachmentTable::new();
        let job_id = JobId::new();
        table.attach(job_id, writer);
        // Give the drop time to be observed by the kernel; several
        // writes may succeed before the peer reset is seen.
        for _ in 0..20 {
            table.forward_output(job_id, "x".to_string()).await;
        }
        assert!(!table.has_attachments(job_id));
    }
}
