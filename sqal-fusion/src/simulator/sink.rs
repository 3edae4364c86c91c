//! Where simulated frames go

use super::SimulatorError;
use crate::pipeline::{FrameAck, FrameStatus, Pipeline};
use reqwest::StatusCode;
use sqal_common::types::FramePayload;
use std::time::Duration;

/// Result of submitting one frame
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Accepted { fused: bool },
    Rejected(String),
}

impl From<FrameAck> for SendOutcome {
    fn from(ack: FrameAck) -> Self {
        SendOutcome::Accepted {
            fused: ack.status == FrameStatus::Fused,
        }
    }
}

pub enum FrameSink {
    /// Straight into a pipeline in this process
    InProcess(Pipeline),
    /// `POST /api/frames` on a running server
    Http {
        client: reqwest::Client,
        endpoint: String,
    },
}

impl FrameSink {
    /// Sink posting to the server at `base_url` (e.g. `http://127.0.0.1:5790`)
    pub fn http(base_url: &str) -> Result<Self, SimulatorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(FrameSink::Http {
            client,
            endpoint: format!("{}/api/frames", base_url.trim_end_matches('/')),
        })
    }

    pub async fn send(&self, payload: &FramePayload) -> Result<SendOutcome, SimulatorError> {
        match self {
            FrameSink::InProcess(pipeline) => Ok(match pipeline.handle_frame(payload.clone()) {
                Ok(ack) => ack.into(),
                Err(err) => SendOutcome::Rejected(err.to_string()),
            }),
            FrameSink::Http { client, endpoint } => {
                let response = client.post(endpoint.as_str()).json(payload).send().await?;
                let status = response.status();
                if status == StatusCode::ACCEPTED {
                    let ack: FrameAck = response.json().await?;
                    Ok(ack.into())
                } else if status == StatusCode::BAD_REQUEST {
                    Ok(SendOutcome::Rejected(response.text().await?))
                } else {
                    Err(SimulatorError::Server {
                        status: status.as_u16(),
                        body: response.text().await.unwrap_or_default(),
                    })
                }
            }
        }
    }
}
