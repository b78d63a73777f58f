use std::time::Duration;

use web_time::Instant;

use crate::scene::{OverlayId, RenderEvent, RenderObserver, Renderer, SceneHost, TextActor};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Counts render events and refreshes an "FPS: x.y" overlay once per second.
pub struct FrameRateMonitor {
    overlay: OverlayId,
    frames: u32,
    window_start: Option<Instant>,
}

impl FrameRateMonitor {
    /// Add the overlay to the host's renderer and subscribe to its render
    /// events.
    pub fn attach(host: &mut SceneHost) {
        let overlay = host.compose_once().renderer.add_overlay(TextActor {
            text: "FPS: --".into(),
            position: [0.02, 0.95],
        });
        host.add_observer(Box::new(Self::new(overlay)));
    }

    fn new(overlay: OverlayId) -> Self {
        Self {
            overlay,
            frames: 0,
            window_start: None,
        }
    }

    /// Record one frame at `now`; returns the new rate when a reporting
    /// interval has elapsed.
    fn record(&mut self, now: Instant) -> Option<f64> {
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;

        let elapsed = now.saturating_duration_since(start);
        if elapsed < REPORT_INTERVAL {
            return None;
        }
        let fps = f64::from(self.frames) / elapsed.as_secs_f64();
        self.frames = 0;
        self.window_start = Some(now);
        Some(fps)
    }
}

impl RenderObserver for FrameRateMonitor {
    fn on_render(&mut self, event: &RenderEvent, renderer: &mut Renderer) {
        let Some(fps) = self.record(event.at) else {
            return;
        };
        if let Some(text) = renderer.overlay_mut(self.overlay) {
            text.text = format!("FPS: {fps:.1}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn reports_once_per_interval() {
        let mut monitor = FrameRateMonitor::new(OverlayId::for_tests(0));
        let start = Instant::now();
        assert_eq!(monitor.record(start), None);
        for i in 1..30 {
            let at = start + Duration::from_millis(i * 30);
            assert_eq!(monitor.record(at), None);
        }
        let fps = monitor.record(start + Duration::from_millis(1000)).unwrap();
        assert_relative_eq!(fps, 31.0, epsilon = 1e-9);
        assert_eq!(monitor.frames, 0);
        assert_eq!(monitor.record(start + Duration::from_millis(1100)), None);
    }

    #[test]
    fn monitor_updates_overlay_text() {
        use crate::render::cpu::CpuRayCaster;
        use crate::scene::SceneConfig;

        let mut host = SceneHost::new(
            Box::new(CpuRayCaster),
            SceneConfig {
                width: 2,
                height: 2,
                ..SceneConfig::default()
            },
        );
        FrameRateMonitor::attach(&mut host);
        let frame = host.force_redraw().unwrap();
        assert_eq!(frame.overlays.len(), 1);
        assert!(frame.overlays[0].text.starts_with("FPS"));

        let renderer = &mut host.compose_once().renderer;
        let mut monitor = FrameRateMonitor::new(OverlayId::for_tests(0));
        let start = Instant::now();
        monitor.on_render(
            &RenderEvent {
                sequence: 1,
                at: start,
                duration: Duration::ZERO,
            },
            renderer,
        );
        monitor.on_render(
            &RenderEvent {
                sequence: 2,
                at: start + Duration::from_secs(2),
                duration: Duration::ZERO,
            },
            renderer,
        );
        assert_eq!(renderer.overlays()[0].text, "FPS: 1.0");
    }
}
