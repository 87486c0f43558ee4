use std::collections::VecDeque;

use acst::{
    headless::{HeadlessDevice, HeadlessEncoder, Trace},
    CommandEncoder as _, DeviceLimits, Generation, SceneAccel,
};

use crate::config::DemoConfig;

/// Simulated time between two frames, in seconds.
const FRAME_DELTA: f32 = 1.0 / 60.0;

/// One frame being recorded.
pub struct Frame {
    pub encoder: HeadlessEncoder,
    pub index: u32,

    /// Seconds since the first frame.
    pub time: f32,
}

/// Statistics of a finished run.
#[derive(Debug, Default)]
pub struct Summary {
    pub frames: u32,
    pub commands: usize,
    pub traces: Vec<Trace>,
}

/// Frame loop keeping a bounded number of command lists in flight.
///
/// Frame `N` starts only after frame `N - frames_in_flight` completed,
/// so host writes into per-frame resources never race the device.
pub struct FrameLoop {
    device: HeadlessDevice,
    scene: SceneAccel<HeadlessDevice>,
    in_flight: VecDeque<Generation>,
    frames_in_flight: usize,
    next_frame: u32,
    traces: Vec<Trace>,
}

impl FrameLoop {
    pub fn new(config: &DemoConfig) -> Self {
        let device = HeadlessDevice::new(
            DeviceLimits::default(),
            config.memory_budget,
            config.query_latency,
        );

        FrameLoop {
            scene: SceneAccel::new(device.clone(), config.accel()),
            device,
            in_flight: VecDeque::new(),
            frames_in_flight: config.frames_in_flight.max(1) as usize,
            next_frame: 0,
            traces: Vec::new(),
        }
    }

    pub fn device(&self) -> &HeadlessDevice {
        &self.device
    }

    pub fn scene(&mut self) -> &mut SceneAccel<HeadlessDevice> {
        &mut self.scene
    }

    /// Number of command lists in flight the loop allows.
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Waits for the oldest frame if too many are in flight
    /// and starts recording the next one.
    pub fn begin(&mut self) -> miette::Result<Frame> {
        while self.in_flight.len() >= self.frames_in_flight {
            let Some(generation) = self.in_flight.pop_front() else {
                break;
            };
            self.device.complete(generation);
            let freed = self.scene.retire_deferred(generation);
            if freed > 0 {
                tracing::trace!("Frame {generation} retired {freed} resources");
            }
            self.check()?;
        }

        let index = self.next_frame;
        self.next_frame += 1;

        Ok(Frame {
            encoder: self.device.new_encoder(),
            index,
            time: index as f32 * FRAME_DELTA,
        })
    }

    /// Records a ray dispatch against the current top-level structure.
    pub fn trace_rays(&self, frame: &mut Frame) -> miette::Result<()> {
        let Some(tlas) = self.scene.tlas().current() else {
            miette::bail!("Top-level structure was never built");
        };
        frame.encoder.trace_rays(tlas);
        Ok(())
    }

    pub fn end(&mut self, frame: Frame) {
        self.in_flight.push_back(frame.encoder.generation());
        self.device.submit(frame.encoder);
    }

    /// Drains the device and releases every resource of the scene.
    pub fn finish(mut self) -> miette::Result<Summary> {
        let completed = self.device.wait_idle();
        self.in_flight.clear();
        self.scene.retire_deferred(completed);
        self.check()?;

        let summary = Summary {
            frames: self.next_frame,
            commands: self.device.submitted_commands(),
            traces: std::mem::take(&mut self.traces),
        };

        let device = self.device.clone();
        self.scene.destroy_idle();

        let leaked = device.live_acceleration_structures();
        if leaked != 0 {
            miette::bail!("{leaked} acceleration structures outlived the scene");
        }

        Ok(summary)
    }

    /// Collects results of executed frames and fails on any validation error.
    fn check(&mut self) -> miette::Result<()> {
        self.traces.extend(self.device.take_traces());

        let errors = self.device.take_validation_errors();
        if let Some(first) = errors.first() {
            miette::bail!(
                "Device reported {} validation errors, first: {first}",
                errors.len()
            );
        }
        Ok(())
    }
}
