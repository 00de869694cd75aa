//! Core state machine for the Lariat loop-trail mechanic.
//!
//! A trailing buffer of waypoints follows a tracked actor. Three periodic
//! timers drive the trail: an insertion tick samples the actor position into
//! the buffer (spatially thinned), a detection tick scans the current frame
//! snapshot for a self-intersection of the newest edge against an earlier
//! edge, and an eviction tick despawns the oldest waypoint. When the trail
//! closes into a loop, the enclosed polygon becomes a transient damage area
//! that strikes every overlapping damage-capable entity once and disables
//! itself after a fixed visibility window.

use lariat_geom::{Point2, point_in_polygon, segments_intersect};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, trace};

new_key_type! {
    /// Stable handle for entities registered in a [`CollisionWorld`].
    pub struct EntityId;
}

/// Errors raised when validating controller configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a [`LoopController`]. Fixed at construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LariatConfig {
    /// Period of the insertion and detection ticks, in seconds.
    pub add_check_period: f32,
    /// Period of the eviction tick, in seconds. Coarser than insertion so the
    /// trail fades from the tail.
    pub remove_period: f32,
    /// Minimum distance between consecutive waypoints. Thins dense sampling
    /// so the visual despawn rate stays uniform regardless of actor speed.
    pub min_waypoint_distance: f32,
    /// How long a materialized damage area stays active, in seconds.
    pub area_visibility: f32,
}

impl Default for LariatConfig {
    fn default() -> Self {
        Self {
            add_check_period: 0.02,
            remove_period: 0.1,
            min_waypoint_distance: 1.0,
            area_visibility: 1.0,
        }
    }
}

impl LariatConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.add_check_period.is_finite() || self.add_check_period <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "add_check_period must be positive and finite",
            ));
        }
        if !self.remove_period.is_finite() || self.remove_period <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "remove_period must be positive and finite",
            ));
        }
        if !self.min_waypoint_distance.is_finite() || self.min_waypoint_distance <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "min_waypoint_distance must be positive and finite",
            ));
        }
        if !self.area_visibility.is_finite() || self.area_visibility <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "area_visibility must be positive and finite",
            ));
        }
        Ok(())
    }
}

/// Position and damage attribute of the tracked actor, sampled by the host
/// each frame. `None` at the controller level is a valid pause state, not a
/// fault.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ActorState {
    pub position: Point2,
    pub damage: f32,
}

impl ActorState {
    /// Construct a new actor sample.
    #[must_use]
    pub const fn new(position: Point2, damage: f32) -> Self {
        Self { position, damage }
    }
}

/// Time-ordered FIFO of waypoints forming the trailing path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrailBuffer {
    waypoints: VecDeque<Point2>,
}

impl TrailBuffer {
    /// Construct an empty trail.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `position` at the tail. A non-empty trail only accepts points
    /// at least `min_distance` from the last inserted waypoint; an empty
    /// trail always accepts. Returns whether a waypoint was added.
    pub fn record(&mut self, position: Point2, min_distance: f32) -> bool {
        if let Some(last) = self.waypoints.back()
            && last.distance(position) < min_distance
        {
            return false;
        }
        self.waypoints.push_back(position);
        true
    }

    /// Remove and return the oldest waypoint.
    pub fn evict(&mut self) -> Option<Point2> {
        self.waypoints.pop_front()
    }

    /// Drop every waypoint.
    pub fn clear(&mut self) {
        self.waypoints.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    /// Immutable ordered copy of the trail. Captured once per frame so that
    /// detection and rendering observe identical points.
    #[must_use]
    pub fn snapshot(&self) -> TrailSnapshot {
        TrailSnapshot {
            points: self.waypoints.iter().copied().collect(),
        }
    }
}

/// Frozen, ordered copy of the trail taken at the top of a frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrailSnapshot {
    points: Vec<Point2>,
}

impl TrailSnapshot {
    #[must_use]
    pub fn points(&self) -> &[Point2] {
        &self.points
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Most recently added waypoint, if any.
    #[must_use]
    pub fn last(&self) -> Option<Point2> {
        self.points.last().copied()
    }
}

impl From<Vec<Point2>> for TrailSnapshot {
    fn from(points: Vec<Point2>) -> Self {
        Self { points }
    }
}

/// Outcome of a positive loop detection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopHit {
    /// Index of the earlier segment crossed by the newest edge; segment `i`
    /// spans snapshot points `i` and `i + 1`.
    pub segment_index: usize,
}

/// Scans `snapshot` for a self-intersection of the newest edge against an
/// earlier, non-adjacent edge.
///
/// Fewer than four points is geometrically meaningless and returns `None`.
/// The two segments adjacent to the test segment share a vertex with it and
/// are excluded from the scan; matching uses strict interior crossings only.
/// The scan stops at the first hit.
#[must_use]
pub fn find_loop(snapshot: &TrailSnapshot) -> Option<LoopHit> {
    let points = snapshot.points();
    if points.len() < 4 {
        return None;
    }
    let tip = points[points.len() - 1];
    let tail = points[points.len() - 2];
    for i in 0..points.len() - 3 {
        if segments_intersect(tip, tail, points[i], points[i + 1], false) {
            return Some(LoopHit { segment_index: i });
        }
    }
    None
}

/// Repeating timer advanced by explicit `tick(dt)` calls; no real time or
/// external scheduler involved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PeriodicTimer {
    period: f32,
    elapsed: f32,
    running: bool,
}

impl PeriodicTimer {
    /// Construct a cancelled timer with the given period.
    #[must_use]
    pub const fn new(period: f32) -> Self {
        Self {
            period,
            elapsed: 0.0,
            running: false,
        }
    }

    /// Re-arm from a clean accumulator.
    pub fn restart(&mut self) {
        self.elapsed = 0.0;
        self.running = true;
    }

    /// Stop the timer and discard accumulated time.
    pub fn cancel(&mut self) {
        self.elapsed = 0.0;
        self.running = false;
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Advance by `dt` seconds, returning how many periods expired. A large
    /// `dt` can expire the timer several times in one call.
    pub fn advance(&mut self, dt: f32) -> u32 {
        if !self.running || dt <= 0.0 {
            return 0;
        }
        self.elapsed += dt;
        let mut fired = 0;
        while self.elapsed >= self.period {
            self.elapsed -= self.period;
            fired += 1;
        }
        fired
    }
}

/// One-shot countdown advanced by explicit `tick(dt)` calls.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct OneShot {
    remaining: Option<f32>,
}

impl OneShot {
    /// Arm (or re-arm) the countdown.
    pub fn arm(&mut self, duration: f32) {
        self.remaining = Some(duration);
    }

    /// Disarm without firing.
    pub fn cancel(&mut self) {
        self.remaining = None;
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.remaining.is_some()
    }

    /// Advance by `dt` seconds; returns true exactly once, on expiry.
    pub fn advance(&mut self, dt: f32) -> bool {
        let Some(remaining) = self.remaining else {
            return false;
        };
        let left = remaining - dt.max(0.0);
        if left <= 0.0 {
            self.remaining = None;
            true
        } else {
            self.remaining = Some(left);
            false
        }
    }
}

/// Broadcast source for level-reset signals, shared between the host and any
/// number of controllers.
#[derive(Debug, Clone, Default)]
pub struct ResetBus {
    epoch: Arc<AtomicU64>,
}

impl ResetBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Broadcast a reset to every listener.
    pub fn fire(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Subscribe. Resets fired before subscription are not observed, and
    /// dropping the listener unsubscribes.
    #[must_use]
    pub fn listener(&self) -> ResetListener {
        ResetListener {
            epoch: Arc::clone(&self.epoch),
            seen: self.epoch.load(Ordering::SeqCst),
        }
    }
}

/// Subscription handle to a [`ResetBus`].
#[derive(Debug)]
pub struct ResetListener {
    epoch: Arc<AtomicU64>,
    seen: u64,
}

impl ResetListener {
    /// Returns true when a reset fired since the last call, consuming it.
    /// Several resets between calls coalesce into one.
    pub fn take_fired(&mut self) -> bool {
        let current = self.epoch.load(Ordering::SeqCst);
        if current == self.seen {
            return false;
        }
        self.seen = current;
        true
    }
}

/// Tangent continuity of one outline spline control point.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TangentMode {
    Linear,
    #[default]
    Continuous,
    Broken,
}

/// Control point of the persistent area outline spline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SplinePoint {
    pub position: Point2,
    pub tangent: TangentMode,
    /// Extrusion height; zero keeps the shape flat.
    pub height: f32,
}

impl SplinePoint {
    /// A flat control point with continuous tangents.
    #[must_use]
    pub const fn flat(position: Point2) -> Self {
        Self {
            position,
            tangent: TangentMode::Continuous,
            height: 0.0,
        }
    }
}

/// Capability implemented by entities that can take damage.
pub trait DamageReceiver {
    fn receive_damage(&mut self, amount: f32);
}

/// Entity surfaced by an overlap query. Entities expose the damage capability
/// through an explicit try-get; those returning `None` are silently skipped.
pub trait Entity {
    fn as_damage_receiver(&mut self) -> Option<&mut dyn DamageReceiver>;
}

/// Collaborator answering "which entities overlap this closed polygon",
/// unfiltered.
pub trait OverlapQuery {
    fn overlapping(&mut self, boundary: &[Point2]) -> Vec<&mut dyn Entity>;
}

/// Trail renderer collaborator. A pure sink; the core never reads back.
pub trait PathRenderer {
    /// Install the trail polyline from ordered waypoints.
    fn set_polyline(&mut self, points: &[Point2]);
    /// Install the two-point connector from the newest waypoint to the actor.
    fn set_connector(&mut self, from: Point2, to: Point2);
    /// Reset the rendered path to empty.
    fn clear(&mut self);
}

/// Area renderer/collider collaborator: a visual outline plus a collision
/// boundary sharing the same polygon, toggled as a unit.
pub trait AreaShape {
    fn set_enabled(&mut self, enabled: bool);
    /// Install the closed collision boundary.
    fn set_boundary(&mut self, points: &[Point2]);
    /// Install the outline spline control points, in order.
    fn set_outline(&mut self, points: &[SplinePoint]);
    /// Drop every outline control point.
    fn clear_outline(&mut self);
}

/// No-op trail renderer for headless hosts.
#[derive(Debug, Default)]
pub struct NullPathRenderer;

impl PathRenderer for NullPathRenderer {
    fn set_polyline(&mut self, _points: &[Point2]) {}
    fn set_connector(&mut self, _from: Point2, _to: Point2) {}
    fn clear(&mut self) {}
}

/// No-op area shape for headless hosts.
#[derive(Debug, Default)]
pub struct NullAreaShape;

impl AreaShape for NullAreaShape {
    fn set_enabled(&mut self, _enabled: bool) {}
    fn set_boundary(&mut self, _points: &[Point2]) {}
    fn set_outline(&mut self, _points: &[SplinePoint]) {}
    fn clear_outline(&mut self) {}
}

struct WorldEntity {
    position: Point2,
    entity: Box<dyn Entity>,
}

/// Reference overlap provider: entities are point colliders stored in a
/// generational arena, and a polygon overlaps an entity when it contains the
/// entity's position.
#[derive(Default)]
pub struct CollisionWorld {
    entities: SlotMap<EntityId, WorldEntity>,
}

impl fmt::Debug for CollisionWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollisionWorld")
            .field("entity_count", &self.entities.len())
            .finish()
    }
}

impl CollisionWorld {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity at `position`, returning its handle.
    pub fn insert(&mut self, position: Point2, entity: Box<dyn Entity>) -> EntityId {
        self.entities.insert(WorldEntity { position, entity })
    }

    /// Remove an entity, returning it if the handle was live.
    pub fn remove(&mut self, id: EntityId) -> Option<Box<dyn Entity>> {
        self.entities.remove(id).map(|entry| entry.entity)
    }

    /// Move an entity to a new position. Returns false for stale handles.
    pub fn set_position(&mut self, id: EntityId, position: Point2) -> bool {
        match self.entities.get_mut(id) {
            Some(entry) => {
                entry.position = position;
                true
            }
            None => false,
        }
    }

    /// Mutable access to an entity.
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut dyn Entity> {
        self.entities
            .get_mut(id)
            .map(|entry| entry.entity.as_mut() as &mut dyn Entity)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl OverlapQuery for CollisionWorld {
    fn overlapping(&mut self, boundary: &[Point2]) -> Vec<&mut dyn Entity> {
        self.entities
            .values_mut()
            .filter(|entry| point_in_polygon(entry.position, boundary))
            .map(|entry| entry.entity.as_mut() as &mut dyn Entity)
            .collect()
    }
}

/// Transient enclosed-polygon damage region. At most one exists per
/// controller; inactive by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DamageArea {
    active: bool,
    visibility: OneShot,
}

impl DamageArea {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Turn the snapshot polygon into a live damage region: enable the shape,
    /// install the boundary, strike every overlapping damage-capable entity
    /// once with `damage`, install the outline spline, and arm the disable
    /// countdown. Returns the number of entities struck.
    ///
    /// Damage is applied exactly once, synchronously; entities entering the
    /// polygon afterward are not damaged retroactively.
    pub fn materialize(
        &mut self,
        snapshot: &TrailSnapshot,
        damage: f32,
        visibility: f32,
        shape: &mut dyn AreaShape,
        world: &mut dyn OverlapQuery,
    ) -> usize {
        shape.set_enabled(true);
        shape.set_boundary(snapshot.points());

        let mut struck = 0;
        for entity in world.overlapping(snapshot.points()) {
            if let Some(receiver) = entity.as_damage_receiver() {
                receiver.receive_damage(damage);
                struck += 1;
            }
        }

        let outline: Vec<SplinePoint> = snapshot
            .points()
            .iter()
            .copied()
            .map(SplinePoint::flat)
            .collect();
        shape.set_outline(&outline);

        self.visibility.arm(visibility);
        self.active = true;
        struck
    }

    /// Clear the outline and turn the shape off. Idempotent; safe to call
    /// when no area is active.
    pub fn disable(&mut self, shape: &mut dyn AreaShape) {
        self.visibility.cancel();
        shape.clear_outline();
        shape.set_enabled(false);
        self.active = false;
    }

    /// Advance the visibility countdown, disabling on expiry. Returns whether
    /// the area expired this call.
    pub fn advance(&mut self, dt: f32, shape: &mut dyn AreaShape) -> bool {
        if self.visibility.advance(dt) {
            self.disable(shape);
            debug!("damage area visibility expired");
            return true;
        }
        false
    }
}

/// Events emitted after processing one controller frame.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct FrameEvents {
    /// Waypoints inserted this frame (thinning may reject insertion ticks).
    pub waypoints_added: u32,
    /// Waypoints despawned from the head this frame.
    pub waypoints_evicted: u32,
    /// Set when the trail closed into a loop this frame.
    pub loop_closed: Option<LoopHit>,
    /// Entities struck by a materialized area this frame.
    pub damaged_entities: usize,
    /// Whether the active area timed out and disabled itself this frame.
    pub area_expired: bool,
    /// Whether the trail timers were cancelled (actor lost) this frame.
    pub timers_cancelled: bool,
    /// Whether the trail timers were restarted (reset signal) this frame.
    pub timers_restarted: bool,
}

/// Orchestrates the trail buffer, loop detection, and area lifecycle against
/// a host-driven frame clock.
pub struct LoopController {
    config: LariatConfig,
    trail: TrailBuffer,
    snapshot: TrailSnapshot,
    actor: Option<ActorState>,
    insertion: PeriodicTimer,
    detection: PeriodicTimer,
    eviction: PeriodicTimer,
    area: DamageArea,
    reset: ResetListener,
}

impl fmt::Debug for LoopController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopController")
            .field("config", &self.config)
            .field("trail_len", &self.trail.len())
            .field("actor", &self.actor)
            .field("timers_running", &self.timers_running())
            .field("area_active", &self.area.is_active())
            .finish()
    }
}

impl LoopController {
    /// Construct a controller with validated configuration and a reset-bus
    /// subscription. Timers start cancelled; call [`Self::attach`] to arm.
    pub fn new(config: LariatConfig, reset: ResetListener) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            insertion: PeriodicTimer::new(config.add_check_period),
            detection: PeriodicTimer::new(config.add_check_period),
            eviction: PeriodicTimer::new(config.remove_period),
            config,
            trail: TrailBuffer::new(),
            snapshot: TrailSnapshot::default(),
            actor: None,
            area: DamageArea::default(),
            reset,
        })
    }

    /// Bind the tracked actor and arm all three trail timers.
    pub fn attach(&mut self, actor: ActorState) {
        self.actor = Some(actor);
        self.restart_timers();
    }

    /// Update (or invalidate) the tracked actor sample. Setting `Some` after
    /// an actor loss does not re-arm the timers; only a reset signal does.
    pub fn set_actor(&mut self, actor: Option<ActorState>) {
        self.actor = actor;
    }

    #[must_use]
    pub const fn actor(&self) -> Option<ActorState> {
        self.actor
    }

    /// Immutable reference to configuration.
    #[must_use]
    pub const fn config(&self) -> &LariatConfig {
        &self.config
    }

    /// Number of waypoints currently buffered.
    #[must_use]
    pub fn trail_len(&self) -> usize {
        self.trail.len()
    }

    /// Snapshot captured at the top of the most recent frame.
    #[must_use]
    pub const fn snapshot(&self) -> &TrailSnapshot {
        &self.snapshot
    }

    /// Whether the damage area is currently materialized.
    #[must_use]
    pub const fn area_active(&self) -> bool {
        self.area.is_active()
    }

    /// Whether the trail timers are armed.
    #[must_use]
    pub const fn timers_running(&self) -> bool {
        self.insertion.is_running() || self.detection.is_running() || self.eviction.is_running()
    }

    /// Re-arm the three trail timers as a unit from clean accumulators.
    /// Buffer contents are untouched.
    pub fn restart_timers(&mut self) {
        self.insertion.restart();
        self.detection.restart();
        self.eviction.restart();
        debug!("trail timers restarted");
    }

    fn cancel_timers(&mut self) {
        self.insertion.cancel();
        self.detection.cancel();
        self.eviction.cancel();
    }

    /// Process one display frame of `dt` seconds.
    ///
    /// The snapshot consumed by detection and rendering is captured once, at
    /// the top of the frame, before the insertion tick mutates the buffer.
    /// Detection therefore runs one insertion behind; the loop-closing edge
    /// depends on this lag and it is preserved deliberately.
    pub fn frame(
        &mut self,
        dt: f32,
        renderer: &mut dyn PathRenderer,
        shape: &mut dyn AreaShape,
        world: &mut dyn OverlapQuery,
    ) -> FrameEvents {
        let mut events = FrameEvents::default();

        if self.reset.take_fired() {
            self.restart_timers();
            events.timers_restarted = true;
        }

        let Some(actor) = self.actor else {
            // Actor loss is an expected pause, not a fault. The area's
            // disable countdown keeps running independently.
            if self.timers_running() {
                self.cancel_timers();
                events.timers_cancelled = true;
                debug!("tracked actor lost; trail timers cancelled");
            }
            events.area_expired = self.area.advance(dt, shape);
            return events;
        };

        self.snapshot = self.trail.snapshot();

        for _ in 0..self.insertion.advance(dt) {
            if self
                .trail
                .record(actor.position, self.config.min_waypoint_distance)
            {
                events.waypoints_added += 1;
                trace!(trail_len = self.trail.len(), "waypoint recorded");
            }
        }

        for _ in 0..self.detection.advance(dt) {
            if events.loop_closed.is_some() {
                // The buffer is already cleared; re-scanning the stale frame
                // snapshot must not materialize a second area.
                break;
            }
            if let Some(hit) = find_loop(&self.snapshot) {
                let struck = self.area.materialize(
                    &self.snapshot,
                    actor.damage,
                    self.config.area_visibility,
                    shape,
                    world,
                );
                self.trail.clear();
                events.loop_closed = Some(hit);
                events.damaged_entities = struck;
                debug!(
                    segment = hit.segment_index,
                    struck, "trail closed into damage area"
                );
            }
        }

        for _ in 0..self.eviction.advance(dt) {
            if self.trail.evict().is_some() {
                events.waypoints_evicted += 1;
            }
        }

        events.area_expired |= self.area.advance(dt, shape);

        if !self.snapshot.is_empty() {
            renderer.set_polyline(self.snapshot.points());
            if let Some(newest) = self.snapshot.last() {
                renderer.set_connector(newest, actor.position);
            }
        }

        events
    }

    /// Explicit stop: cancel every timer, clear the trail, reset the rendered
    /// path, and force-disable the area, bypassing its countdown. Idempotent.
    pub fn cancel(&mut self, renderer: &mut dyn PathRenderer, shape: &mut dyn AreaShape) {
        self.cancel_timers();
        self.trail.clear();
        self.snapshot = TrailSnapshot::default();
        renderer.clear();
        self.area.disable(shape);
        debug!("lasso cancelled; trail and area cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn p(x: f32, y: f32) -> Point2 {
        Point2::new(x, y)
    }

    #[derive(Debug, Default)]
    struct RecordingRenderer {
        polyline: Vec<Point2>,
        connector: Option<(Point2, Point2)>,
    }

    impl PathRenderer for RecordingRenderer {
        fn set_polyline(&mut self, points: &[Point2]) {
            self.polyline = points.to_vec();
        }

        fn set_connector(&mut self, from: Point2, to: Point2) {
            self.connector = Some((from, to));
        }

        fn clear(&mut self) {
            self.polyline.clear();
            self.connector = None;
        }
    }

    #[derive(Debug, Default)]
    struct RecordingShape {
        enabled: bool,
        boundary: Vec<Point2>,
        outline: Vec<SplinePoint>,
    }

    impl AreaShape for RecordingShape {
        fn set_enabled(&mut self, enabled: bool) {
            self.enabled = enabled;
        }

        fn set_boundary(&mut self, points: &[Point2]) {
            self.boundary = points.to_vec();
        }

        fn set_outline(&mut self, points: &[SplinePoint]) {
            self.outline = points.to_vec();
        }

        fn clear_outline(&mut self) {
            self.outline.clear();
        }
    }

    struct Enemy {
        health: Rc<Cell<f32>>,
    }

    impl Enemy {
        fn spawn(health: f32) -> (Box<Self>, Rc<Cell<f32>>) {
            let cell = Rc::new(Cell::new(health));
            (
                Box::new(Self {
                    health: Rc::clone(&cell),
                }),
                cell,
            )
        }
    }

    impl DamageReceiver for Enemy {
        fn receive_damage(&mut self, amount: f32) {
            self.health.set(self.health.get() - amount);
        }
    }

    impl Entity for Enemy {
        fn as_damage_receiver(&mut self) -> Option<&mut dyn DamageReceiver> {
            Some(self)
        }
    }

    /// Scenery without the damage capability.
    struct Rock;

    impl Entity for Rock {
        fn as_damage_receiver(&mut self) -> Option<&mut dyn DamageReceiver> {
            None
        }
    }

    #[test]
    fn config_defaults_validate() {
        assert_eq!(LariatConfig::default().validate(), Ok(()));
    }

    #[test]
    fn config_rejects_non_positive_tunables() {
        let bad = LariatConfig {
            add_check_period: 0.0,
            ..LariatConfig::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        let bad = LariatConfig {
            min_waypoint_distance: -1.0,
            ..LariatConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = LariatConfig {
            area_visibility: f32::NAN,
            ..LariatConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn trail_thins_points_below_min_distance() {
        let mut trail = TrailBuffer::new();
        assert!(trail.record(p(0.0, 0.0), 1.0));
        assert!(!trail.record(p(0.5, 0.0), 1.0));
        assert!(trail.record(p(1.0, 0.0), 1.0));
        assert!(!trail.record(p(1.0, 0.9), 1.0));
        assert!(trail.record(p(1.0, 1.0), 1.0));

        let points = trail.snapshot().points().to_vec();
        for pair in points.windows(2) {
            assert!(pair[0].distance(pair[1]) >= 1.0);
        }
    }

    #[test]
    fn trail_evicts_oldest_first() {
        let mut trail = TrailBuffer::new();
        for i in 0..5 {
            trail.record(p(i as f32, 0.0), 1.0);
        }
        assert_eq!(trail.evict(), Some(p(0.0, 0.0)));
        assert_eq!(trail.evict(), Some(p(1.0, 0.0)));
        assert_eq!(trail.len(), 3);

        for _ in 0..10 {
            trail.evict();
        }
        assert!(trail.is_empty());
        assert_eq!(trail.evict(), None);
    }

    #[test]
    fn detector_ignores_short_trails() {
        let snapshot = TrailSnapshot::from(vec![p(0.0, 0.0), p(0.0, 5.0), p(5.0, 5.0)]);
        assert_eq!(find_loop(&snapshot), None);
    }

    #[test]
    fn detector_finds_first_crossing() {
        // The closing edge crosses the very first segment strictly inside
        // both spans.
        let snapshot = TrailSnapshot::from(vec![
            p(0.0, 0.0),
            p(0.0, 3.0),
            p(3.0, 3.0),
            p(3.0, 1.0),
            p(-1.0, 1.0),
        ]);
        assert_eq!(find_loop(&snapshot), Some(LoopHit { segment_index: 0 }));
    }

    #[test]
    fn detector_skips_segments_adjacent_to_test_edge() {
        // A hairpin: the closing edge doubles back over the segment it shares
        // a vertex with, but no non-adjacent segment is crossed.
        let snapshot = TrailSnapshot::from(vec![
            p(0.0, 0.0),
            p(4.0, 0.0),
            p(8.0, 0.0),
            p(12.0, 0.0),
            p(9.0, 0.1),
        ]);
        assert_eq!(find_loop(&snapshot), None);
    }

    #[test]
    fn periodic_timer_accumulates_and_catches_up() {
        let mut timer = PeriodicTimer::new(0.02);
        assert_eq!(timer.advance(1.0), 0, "cancelled timers never fire");

        timer.restart();
        assert_eq!(timer.advance(0.01), 0);
        assert_eq!(timer.advance(0.01), 1);
        assert_eq!(timer.advance(0.07), 3);

        timer.cancel();
        assert!(!timer.is_running());
        assert_eq!(timer.advance(1.0), 0);

        timer.restart();
        assert_eq!(timer.advance(0.019), 0, "restart clears the accumulator");
    }

    #[test]
    fn one_shot_fires_exactly_once() {
        let mut shot = OneShot::default();
        assert!(!shot.advance(1.0));

        shot.arm(0.5);
        assert!(!shot.advance(0.3));
        assert!(shot.advance(0.3));
        assert!(!shot.is_armed());
        assert!(!shot.advance(1.0));

        shot.arm(0.5);
        shot.cancel();
        assert!(!shot.advance(1.0));
    }

    #[test]
    fn reset_listener_consumes_fired_signal() {
        let bus = ResetBus::new();
        let mut listener = bus.listener();
        assert!(!listener.take_fired());

        bus.fire();
        bus.fire();
        assert!(listener.take_fired(), "resets coalesce");
        assert!(!listener.take_fired());

        let mut late = bus.listener();
        assert!(!late.take_fired(), "prior resets are not replayed");
    }

    #[test]
    fn materialize_damages_capable_entities_once() {
        let mut shape = RecordingShape::default();
        let mut world = CollisionWorld::new();
        let (enemy, enemy_health) = Enemy::spawn(10.0);
        world.insert(p(1.0, 2.0), enemy);
        world.insert(p(1.5, 2.0), Box::new(Rock));
        let (bystander, bystander_health) = Enemy::spawn(10.0);
        world.insert(p(10.0, 10.0), bystander);

        let snapshot = TrailSnapshot::from(vec![
            p(0.0, 0.0),
            p(0.0, 3.0),
            p(3.0, 3.0),
            p(3.0, 1.0),
            p(-1.0, 1.0),
        ]);
        let mut area = DamageArea::default();
        let struck = area.materialize(&snapshot, 2.5, 1.0, &mut shape, &mut world);

        assert_eq!(struck, 1, "the rock is silently skipped");
        assert_eq!(enemy_health.get(), 7.5, "damage equals the actor attribute");
        assert_eq!(bystander_health.get(), 10.0, "outside the polygon");
        assert!(area.is_active());
        assert!(shape.enabled);
        assert_eq!(shape.boundary, snapshot.points());
        assert_eq!(shape.outline.len(), snapshot.len());
        assert!(
            shape
                .outline
                .iter()
                .all(|cp| cp.tangent == TangentMode::Continuous && cp.height == 0.0)
        );
    }

    #[test]
    fn area_disable_is_idempotent() {
        let mut shape = RecordingShape::default();
        let mut world = CollisionWorld::new();
        let snapshot = TrailSnapshot::from(vec![
            p(0.0, 0.0),
            p(0.0, 3.0),
            p(3.0, 3.0),
            p(3.0, 1.0),
            p(-1.0, 1.0),
        ]);

        let mut area = DamageArea::default();
        area.disable(&mut shape);
        assert!(!area.is_active());

        area.materialize(&snapshot, 1.0, 1.0, &mut shape, &mut world);
        area.disable(&mut shape);
        let outline_after_one = shape.outline.len();
        let enabled_after_one = shape.enabled;
        area.disable(&mut shape);
        assert_eq!(shape.outline.len(), outline_after_one);
        assert_eq!(shape.enabled, enabled_after_one);
        assert!(!shape.enabled);
        assert!(shape.outline.is_empty());
        assert!(!area.is_active());
    }

    #[test]
    fn area_expires_after_visibility_window() {
        let mut shape = RecordingShape::default();
        let mut world = CollisionWorld::new();
        let snapshot = TrailSnapshot::from(vec![
            p(0.0, 0.0),
            p(0.0, 3.0),
            p(3.0, 3.0),
            p(3.0, 1.0),
            p(-1.0, 1.0),
        ]);
        let mut area = DamageArea::default();
        area.materialize(&snapshot, 1.0, 0.5, &mut shape, &mut world);

        assert!(!area.advance(0.3, &mut shape));
        assert!(area.is_active());
        assert!(area.advance(0.3, &mut shape));
        assert!(!area.is_active());
        assert!(!shape.enabled);
        assert!(!area.advance(1.0, &mut shape));
    }

    #[test]
    fn collision_world_overlap_uses_containment() {
        let mut world = CollisionWorld::new();
        let inside = world.insert(p(1.0, 1.0), Enemy::spawn(1.0).0);
        world.insert(p(5.0, 5.0), Enemy::spawn(1.0).0);
        let square = [p(0.0, 0.0), p(0.0, 2.0), p(2.0, 2.0), p(2.0, 0.0)];

        let hits = world.overlapping(&square);
        assert_eq!(hits.len(), 1);

        assert!(world.set_position(inside, p(9.0, 9.0)));
        assert!(world.overlapping(&square).is_empty());

        assert!(world.remove(inside).is_some());
        assert!(!world.set_position(inside, p(0.0, 0.0)));
        assert!(world.entity_mut(inside).is_none());
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn detection_lags_insertion_by_one_frame() {
        let config = LariatConfig {
            add_check_period: 0.02,
            remove_period: 100.0,
            min_waypoint_distance: 1.0,
            area_visibility: 1.0,
        };
        let bus = ResetBus::new();
        let mut controller = LoopController::new(config, bus.listener()).expect("controller");
        let mut renderer = RecordingRenderer::default();
        let mut shape = RecordingShape::default();
        let mut world = CollisionWorld::new();

        let path = [
            p(0.0, 0.0),
            p(0.0, 3.0),
            p(3.0, 3.0),
            p(3.0, 1.0),
            p(-1.0, 1.0),
        ];
        controller.attach(ActorState::new(path[0], 1.0));
        for &position in &path {
            controller.set_actor(Some(ActorState::new(position, 1.0)));
            let events = controller.frame(0.02, &mut renderer, &mut shape, &mut world);
            assert_eq!(
                events.loop_closed, None,
                "closing edge is only visible in the next frame's snapshot"
            );
        }
        assert_eq!(controller.trail_len(), 5);

        // Actor holds still: nothing is inserted, but the frame snapshot now
        // carries the closing edge.
        let events = controller.frame(0.02, &mut renderer, &mut shape, &mut world);
        assert_eq!(events.waypoints_added, 0);
        assert_eq!(events.loop_closed, Some(LoopHit { segment_index: 0 }));
        assert_eq!(controller.trail_len(), 0, "buffer clears on detection");
        assert!(controller.area_active());
    }

    #[test]
    fn frame_renders_snapshot_and_connector() {
        let config = LariatConfig::default();
        let bus = ResetBus::new();
        let mut controller = LoopController::new(config, bus.listener()).expect("controller");
        let mut renderer = RecordingRenderer::default();
        let mut shape = RecordingShape::default();
        let mut world = CollisionWorld::new();

        controller.attach(ActorState::new(p(0.0, 0.0), 1.0));
        controller.frame(0.02, &mut renderer, &mut shape, &mut world);
        assert!(
            renderer.polyline.is_empty(),
            "first frame renders the pre-insertion snapshot"
        );

        controller.set_actor(Some(ActorState::new(p(2.0, 0.0), 1.0)));
        controller.frame(0.02, &mut renderer, &mut shape, &mut world);
        assert_eq!(renderer.polyline, vec![p(0.0, 0.0)]);
        assert_eq!(renderer.connector, Some((p(0.0, 0.0), p(2.0, 0.0))));
    }

    #[test]
    fn cancel_clears_everything_and_is_idempotent() {
        let config = LariatConfig::default();
        let bus = ResetBus::new();
        let mut controller = LoopController::new(config, bus.listener()).expect("controller");
        let mut renderer = RecordingRenderer::default();
        let mut shape = RecordingShape::default();
        let mut world = CollisionWorld::new();

        controller.attach(ActorState::new(p(0.0, 0.0), 1.0));
        controller.frame(0.02, &mut renderer, &mut shape, &mut world);
        controller.set_actor(Some(ActorState::new(p(5.0, 0.0), 1.0)));
        controller.frame(0.02, &mut renderer, &mut shape, &mut world);
        assert!(controller.trail_len() > 0);

        controller.cancel(&mut renderer, &mut shape);
        assert_eq!(controller.trail_len(), 0);
        assert!(!controller.timers_running());
        assert!(renderer.polyline.is_empty());
        assert!(renderer.connector.is_none());
        assert!(!controller.area_active());

        controller.cancel(&mut renderer, &mut shape);
        assert!(!controller.timers_running());
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let bus = ResetBus::new();
        let config = LariatConfig {
            remove_period: 0.0,
            ..LariatConfig::default()
        };
        assert!(LoopController::new(config, bus.listener()).is_err());
    }
}
