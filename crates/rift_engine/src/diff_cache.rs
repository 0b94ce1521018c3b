use glam::IVec3;
use rustc_hash::FxHashMap;

const BUCKET_SHIFT: i32 = 2;

fn bucket_of(pos: IVec3) -> IVec3 {
    IVec3::new(pos.x >> BUCKET_SHIFT, pos.y >> BUCKET_SHIFT, pos.z >> BUCKET_SHIFT)
}

/// Last value sent to one client for each overridden cell. A cell that is
/// absent is showing the true world value.
#[derive(Debug)]
pub struct SpatialDiffCache<V> {
    buckets: FxHashMap<IVec3, FxHashMap<IVec3, V>>,
    len: usize,
}

impl<V> Default for SpatialDiffCache<V> {
    fn default() -> Self {
        Self {
            buckets: FxHashMap::default(),
            len: 0,
        }
    }
}

impl<V> SpatialDiffCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, pos: IVec3) -> Option<&V> {
        self.buckets.get(&bucket_of(pos))?.get(&pos)
    }

    pub fn contains(&self, pos: IVec3) -> bool {
        self.get(pos).is_some()
    }

    pub fn put(&mut self, pos: IVec3, value: V) -> Option<V> {
        let previous = self
            .buckets
            .entry(bucket_of(pos))
            .or_default()
            .insert(pos, value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    pub fn remove(&mut self, pos: IVec3) -> Option<V> {
        let key = bucket_of(pos);
        let bucket = self.buckets.get_mut(&key)?;
        let removed = bucket.remove(&pos);
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Removes every listed cell, handing each removed value to `on_remove`.
    pub fn purge<I, F>(&mut self, positions: I, mut on_remove: F)
    where
        I: IntoIterator<Item = IVec3>,
        F: FnMut(IVec3, V),
    {
        for pos in positions {
            if let Some(value) = self.remove(pos) {
                on_remove(pos, value);
            }
        }
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(IVec3, &V) -> bool,
    {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|pos, value| keep(*pos, value));
            removed += before - bucket.len();
            !bucket.is_empty()
        });
        self.len -= removed;
    }

    pub fn drain(&mut self) -> Vec<(IVec3, V)> {
        self.len = 0;
        self.buckets
            .drain()
            .flat_map(|(_, bucket)| bucket.into_iter())
            .collect()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }

    pub fn positions(&self) -> impl Iterator<Item = IVec3> + '_ {
        self.buckets.values().flat_map(|bucket| bucket.keys().copied())
    }
}

impl<V: PartialEq> SpatialDiffCache<V> {
    /// Stores `value` and reports whether it differs from what was cached.
    pub fn update(&mut self, pos: IVec3, value: V) -> bool {
        if self.get(pos) == Some(&value) {
            return false;
        }
        self.put(pos, value);
        true
    }
}
