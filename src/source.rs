//! Data sources: grouping classified frames into task inputs.

use crate::classify::ClassifiedFrame;
use crate::core::{ArcStr, Blake3Hasher, Frame, Hash32, Metadata};

/// Match keyword values shared by every frame of a group. A keyword missing
/// from the header is recorded as `None` and groups like any other value.
pub type GroupKey = Vec<(String, Option<String>)>;

/// A homogeneous set of frames feeding one task instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub category: ArcStr,
    pub key: GroupKey,
    /// Metadata of the first frame of the group.
    pub representative: Metadata,
    /// Frames in arrival order.
    pub frames: Vec<Frame>,
}

impl Group {
    /// Stable identity of the group, independent of the process that built it.
    pub fn fingerprint(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        hasher.field(self.category.as_bytes());

        for (keyword, value) in &self.key {
            hasher.field(keyword);
            match value {
                Some(value) => hasher.field([1u8]).field(value),
                None => hasher.field([0u8]),
            };
        }

        for frame in &self.frames {
            hasher.field(frame.path.as_str());
        }

        hasher.into()
    }

    /// Short human readable form of the key, e.g. `instrume=ANDES`.
    pub fn describe_key(&self) -> String {
        describe_key(&self.key)
    }
}

pub(crate) fn describe_key(key: &GroupKey) -> String {
    key.iter()
        .map(|(k, v)| format!("{k}={}", v.as_deref().unwrap_or("-")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Grouping policy for frames of a single category.
#[derive(Debug, Clone)]
pub struct DataSource {
    pub(crate) category: ArcStr,
    pub(crate) match_keywords: Vec<String>,
}

impl DataSource {
    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn match_keywords(&self) -> &[String] {
        &self.match_keywords
    }

    fn key_of(&self, frame: &Frame) -> GroupKey {
        self.match_keywords
            .iter()
            .map(|k| (k.clone(), frame.get(k).map(str::to_string)))
            .collect()
    }

    /// Partitions the frames of the bound category by their match keyword
    /// values. Groups come out in the order of first appearance.
    pub fn resolve(&self, classified: &[ClassifiedFrame]) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();

        for item in classified.iter().filter(|c| c.category == self.category) {
            let key = self.key_of(&item.frame);

            match groups.iter_mut().find(|g| g.key == key) {
                Some(group) => group.frames.push(item.frame.clone()),
                None => groups.push(Group {
                    category: self.category.clone(),
                    key,
                    representative: item.frame.meta.clone(),
                    frames: vec![item.frame.clone()],
                }),
            }
        }

        groups
    }
}
