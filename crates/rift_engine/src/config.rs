use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

const MIN_TICK_RATE: u32 = 1;
const MAX_TICK_RATE: u32 = 100;
const MIN_RENDER_DISTANCE: f32 = 8.0;
const MAX_RENDER_DISTANCE: f32 = 256.0;
const MIN_ATMOSPHERE_RADIUS: f32 = 2.0;
const MAX_PORTAL_DEPTH: i32 = 16;
const MAX_LINK_SEARCH_RADIUS: i32 = 64;

/// Read-only tunables of the portal engine. Every key is optional in TOML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_rate: u32,
    pub render_distance: f32,
    pub horizontal_send_limit: f32,
    pub atmosphere_radius: f32,
    pub portal_depth: i32,
    pub scan_interval_ticks: u64,
    pub portal_grace_ticks: i64,
    pub flicker_guard_ticks: u32,
    pub occlusion_check: bool,
    pub near_portal_distance: f32,
    pub entity_hide_distance: f32,
    pub link_search_radius: i32,
    pub destination_offset: [i32; 3],
    pub worker_threads: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            render_distance: 64.0,
            horizontal_send_limit: 48.0,
            atmosphere_radius: 24.0,
            portal_depth: 2,
            scan_interval_ticks: 30,
            portal_grace_ticks: 90,
            flicker_guard_ticks: 10,
            occlusion_check: true,
            near_portal_distance: 6.0,
            entity_hide_distance: 16.0,
            link_search_radius: 16,
            destination_offset: [0, 0, 0],
            worker_threads: None,
        }
    }
}

impl EngineConfig {
    pub fn sanitize(mut self) -> Self {
        self.tick_rate = self.tick_rate.clamp(MIN_TICK_RATE, MAX_TICK_RATE);
        self.render_distance = self
            .render_distance
            .clamp(MIN_RENDER_DISTANCE, MAX_RENDER_DISTANCE);
        self.horizontal_send_limit = self
            .horizontal_send_limit
            .clamp(1.0, self.render_distance);
        self.atmosphere_radius = self
            .atmosphere_radius
            .clamp(MIN_ATMOSPHERE_RADIUS, self.render_distance);
        self.portal_depth = self.portal_depth.clamp(0, MAX_PORTAL_DEPTH);
        self.scan_interval_ticks = self.scan_interval_ticks.max(1);
        self.portal_grace_ticks = self.portal_grace_ticks.max(1);
        self.near_portal_distance = self.near_portal_distance.max(0.0);
        self.entity_hide_distance = self.entity_hide_distance.max(0.0);
        self.link_search_radius = self.link_search_radius.clamp(0, MAX_LINK_SEARCH_RADIUS);
        self.worker_threads = self.worker_threads.map(|threads| threads.max(1));
        self
    }

    pub fn from_toml_str(contents: &str) -> io::Result<Self> {
        let parsed = toml::from_str::<Self>(contents).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to deserialize engine config: {e}"),
            )
        })?;
        Ok(parsed.sanitize())
    }

    /// Reads a standalone engine config file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Seconds between worker ticks.
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }

    pub fn destination_offset(&self) -> glam::IVec3 {
        glam::IVec3::from_array(self.destination_offset)
    }
}
