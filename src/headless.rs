//! Stand-in platform collaborators for hosts without a desktop session.

use crate::activity::{PointerPosition, PointerSource};
use crate::model::{Content, SurfaceSignals};
use crate::trigger::{DisplaySurface, RenderRequest};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Logs each render request and keeps it "open" for its duration. Reports no
/// interaction.
#[derive(Debug, Clone, Default)]
pub struct LoggingSurface;

#[async_trait]
impl DisplaySurface for LoggingSurface {
    async fn present(&self, request: RenderRequest) -> Result<SurfaceSignals> {
        match &request.content {
            Content::Image { image, width } => info!(
                message_id = request.message_id,
                zone = request.zone,
                image_len = image.len(),
                width,
                "showing image"
            ),
            Content::Text { title, text } => info!(
                message_id = request.message_id,
                zone = request.zone,
                %title,
                %text,
                "showing text"
            ),
        }
        tokio::time::sleep(Duration::from_secs(u64::from(request.duration_seconds))).await;
        Ok(SurfaceSignals::default())
    }
}

/// A pointer that never moves.
#[derive(Debug, Clone, Copy, Default)]
pub struct StillPointer;

impl PointerSource for StillPointer {
    fn position(&self) -> PointerPosition {
        PointerPosition::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_surface_reports_no_interaction() {
        let signals = LoggingSurface
            .present(RenderRequest {
                message_id: 1,
                content: Content::Text {
                    title: "Aviso".into(),
                    text: "Corte de luz".into(),
                },
                zone: 0,
                duration_seconds: 0,
                link: None,
            })
            .await
            .unwrap();
        assert_eq!(signals, SurfaceSignals::default());
    }
}
