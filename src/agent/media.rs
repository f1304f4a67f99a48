//! Media element tracking inside one source

use crate::channel::Volume;

/// Identifier of a media element within its source
pub type ElementId = u64;

/// A playable element (audio or video) discovered in a source
#[derive(Debug, Clone, PartialEq)]
pub struct MediaElement {
    pub id: ElementId,
    pub volume: Volume,
    /// Seconds; `None` until metadata is loaded
    pub duration: Option<f64>,
    pub paused: bool,
    pub muted: bool,
}

impl MediaElement {
    /// A freshly discovered element: paused, full volume, no metadata
    pub fn new(id: ElementId) -> Self {
        Self {
            id,
            volume: Volume::FULL,
            duration: None,
            paused: true,
            muted: false,
        }
    }

    pub fn with_volume(mut self, volume: Volume) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn playing(mut self) -> Self {
        self.paused = false;
        self
    }

    /// Real, playable media has a non-zero duration (live streams report infinity)
    pub fn has_known_duration(&self) -> bool {
        self.duration.is_some_and(|d| d != 0.0 && !d.is_nan())
    }

    pub fn is_audible(&self) -> bool {
        !self.paused && !self.muted
    }
}

/// The set of media elements known to an agent, in discovery order
#[derive(Debug, Default)]
pub struct MediaTracker {
    elements: Vec<MediaElement>,
}

impl MediaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an element; returns false if it was already known
    pub fn track(&mut self, element: MediaElement) -> bool {
        if self.get(element.id).is_some() {
            return false;
        }
        self.elements.push(element);
        true
    }

    pub fn forget(&mut self, id: ElementId) -> Option<MediaElement> {
        let index = self.elements.iter().position(|e| e.id == id)?;
        Some(self.elements.remove(index))
    }

    pub fn get(&self, id: ElementId) -> Option<&MediaElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: ElementId) -> Option<&mut MediaElement> {
        self.elements.iter_mut().find(|e| e.id == id)
    }

    pub fn elements(&self) -> &[MediaElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Apply `volume` to every element; returns how many actually changed
    pub fn set_all(&mut self, volume: Volume) -> usize {
        let mut changed = 0;
        for element in self.elements.iter_mut().filter(|e| e.volume != volume) {
            element.volume = volume;
            changed += 1;
        }
        changed
    }

    /// Volume of the first element with real media, or `fallback`
    pub fn representative_volume(&self, fallback: Volume) -> Volume {
        self.elements
            .iter()
            .find(|e| e.has_known_duration())
            .map(|e| e.volume)
            .unwrap_or(fallback)
    }

    pub fn is_audible(&self) -> bool {
        self.elements.iter().any(MediaElement::is_audible)
    }
}
