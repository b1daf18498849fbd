//! Redis Streams wire contract: job messages in, handoff messages out

use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_redis::redis;
use grader_common::{GraderError, GraderResult, HandoffMessage, JobMessage};

/// Publishes handoff requests for the external sync agent
#[async_trait]
pub trait HandoffPublisher: Send + Sync {
    async fn publish(&self, queue: &str, message: &HandoffMessage) -> GraderResult<()>;
}

/// Handoff publisher backed by Redis Streams
pub struct RedisPublisher {
    pool: deadpool_redis::Pool,
}

impl RedisPublisher {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }
}

fn queue_error(e: impl std::fmt::Display) -> GraderError {
    GraderError::Queue(e.to_string())
}

#[async_trait]
impl HandoffPublisher for RedisPublisher {
    async fn publish(&self, queue: &str, message: &HandoffMessage) -> GraderResult<()> {
        let mut conn = self.pool.get().await.map_err(queue_error)?;

        redis::cmd("XADD")
            .arg(queue)
            .arg("*")
            .arg("complete_file")
            .arg(&message.complete_file)
            .arg("remote_dir")
            .arg(&message.remote_dir)
            .arg("user")
            .arg(&message.user)
            .arg("host")
            .arg(&message.host)
            .arg("submission_id")
            .arg(message.submission_id.to_string())
            .arg("testable_id")
            .arg(message.testable_id.to_string())
            .query_async::<String>(&mut *conn)
            .await
            .map_err(queue_error)?;

        tracing::debug!(
            queue,
            complete_file = %message.complete_file,
            "Published handoff"
        );
        Ok(())
    }
}

/// Message read from the job stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamJob {
    pub message_id: String,
    pub job: JobMessage,
}

/// Parse an XREADGROUP reply into jobs.
///
/// XREADGROUP returns: [[stream_name, [[message_id, [field, value, ...]], ...]]]
/// Entries without a usable job are returned as errors next to their id so
/// the caller can acknowledge and drop them.
pub fn parse_stream_reply(
    reply: &[redis::Value],
) -> GraderResult<Vec<Result<StreamJob, (String, GraderError)>>> {
    let stream_data = match reply.first() {
        Some(redis::Value::Array(data)) => data,
        None => return Ok(Vec::new()),
        _ => return Err(GraderError::Queue("Invalid stream response format".into())),
    };

    let messages = match stream_data.get(1) {
        Some(redis::Value::Array(msgs)) => msgs,
        _ => return Err(GraderError::Queue("No messages in response".into())),
    };

    let mut jobs = Vec::with_capacity(messages.len());
    for message in messages {
        let redis::Value::Array(message) = message else {
            return Err(GraderError::Queue("No message data".into()));
        };

        let message_id = match message.first() {
            Some(redis::Value::BulkString(id)) => String::from_utf8_lossy(id).to_string(),
            _ => return Err(GraderError::Queue("Invalid message ID".into())),
        };

        // Claimed entries that were deleted meanwhile come back without fields.
        let fields = match message.get(1) {
            Some(redis::Value::Array(f)) => f.as_slice(),
            _ => &[],
        };

        jobs.push(parse_job(fields).map(|job| StreamJob {
            message_id: message_id.clone(),
            job,
        })
        .map_err(|e| (message_id, e)));
    }

    Ok(jobs)
}

fn parse_job(fields: &[redis::Value]) -> GraderResult<JobMessage> {
    let mut field_map = HashMap::new();
    for chunk in fields.chunks(2) {
        if let [redis::Value::BulkString(key), redis::Value::BulkString(value)] = chunk {
            field_map.insert(
                String::from_utf8_lossy(key).to_string(),
                String::from_utf8_lossy(value).to_string(),
            );
        }
    }

    let field = |name: &str| -> GraderResult<u64> {
        field_map
            .get(name)
            .ok_or_else(|| GraderError::Queue(format!("Missing {name}")))?
            .parse()
            .map_err(|e| GraderError::Queue(format!("Invalid {name}: {e}")))
    };

    Ok(JobMessage {
        submission_id: field("submission_id")?,
        testable_id: field("testable_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> redis::Value {
        redis::Value::BulkString(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[&str]) -> redis::Value {
        redis::Value::Array(vec![
            bulk(id),
            redis::Value::Array(fields.iter().map(|f| bulk(f)).collect()),
        ])
    }

    #[test]
    fn test_parse_stream_reply() {
        let reply = vec![redis::Value::Array(vec![
            bulk("queue_tell_worker"),
            redis::Value::Array(vec![
                entry("1-0", &["submission_id", "42", "testable_id", "7"]),
                entry("2-0", &["submission_id", "x", "testable_id", "7"]),
                entry("3-0", &["testable_id", "7"]),
            ]),
        ])];

        let jobs = parse_stream_reply(&reply).unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(
            jobs[0].as_ref().unwrap(),
            &StreamJob {
                message_id: "1-0".to_string(),
                job: JobMessage {
                    submission_id: 42,
                    testable_id: 7
                },
            }
        );
        assert!(matches!(&jobs[1], Err((id, GraderError::Queue(_))) if id == "2-0"));
        assert!(matches!(&jobs[2], Err((id, _)) if id == "3-0"));
    }

    #[test]
    fn test_empty_reply() {
        assert!(parse_stream_reply(&[]).unwrap().is_empty());
        assert!(parse_stream_reply(&[redis::Value::Nil]).is_err());
    }
}
