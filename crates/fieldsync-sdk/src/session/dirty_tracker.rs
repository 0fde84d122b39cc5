/// 未保存修改检测
///
/// 只比较草稿与最近一次确认的快照，不关心存储和网络。
#[derive(Debug, Clone)]
pub struct DirtyTracker<T: Clone + PartialEq> {
    initial_snapshot: T,
    current_draft: T,
}

impl<T: Clone + PartialEq> DirtyTracker<T> {
    pub fn new(initial: T) -> Self {
        Self {
            current_draft: initial.clone(),
            initial_snapshot: initial,
        }
    }

    pub fn snapshot(&self) -> &T {
        &self.initial_snapshot
    }

    pub fn draft(&self) -> &T {
        &self.current_draft
    }

    /// 草稿与快照是否不同（结构比较）
    pub fn is_dirty(&self) -> bool {
        self.current_draft != self.initial_snapshot
    }

    pub fn set_draft(&mut self, draft: T) {
        self.current_draft = draft;
    }

    /// 原地修改草稿
    pub fn edit<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.current_draft)
    }

    /// 保存成功（远端或本地日志）后，以当前草稿为新快照
    pub fn mark_saved(&mut self) {
        self.initial_snapshot = self.current_draft.clone();
    }

    /// 快照和草稿同时重置（加载完成时）
    pub fn reset(&mut self, value: T) {
        self.current_draft = value.clone();
        self.initial_snapshot = value;
    }

    /// 放弃未保存的修改
    pub fn discard_changes(&mut self) {
        self.current_draft = self.initial_snapshot.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clean_after_reset_and_save() {
        let mut tracker = DirtyTracker::new(json!({"count": 3}));
        assert!(!tracker.is_dirty());

        tracker.edit(|draft| draft["count"] = json!(5));
        assert!(tracker.is_dirty());

        tracker.mark_saved();
        assert!(!tracker.is_dirty());
        assert_eq!(tracker.snapshot(), &json!({"count": 5}));
    }

    #[test]
    fn test_reverting_a_field_is_clean() {
        let mut tracker = DirtyTracker::new(json!({"count": 3, "site": "A"}));
        tracker.edit(|draft| draft["count"] = json!(4));
        tracker.edit(|draft| draft["count"] = json!(3));
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn test_nested_change_is_dirty() {
        let mut tracker = DirtyTracker::new(json!({"panels": [{"id": 1, "breakers": 4}]}));
        tracker.edit(|draft| draft["panels"][0]["breakers"] = json!(6));
        assert!(tracker.is_dirty());

        tracker.discard_changes();
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn test_set_draft_and_reset() {
        let mut tracker = DirtyTracker::new(Vec::<u32>::new());
        tracker.set_draft(vec![1]);
        assert!(tracker.is_dirty());
        tracker.reset(vec![1, 2]);
        assert!(!tracker.is_dirty());
        assert_eq!(tracker.draft(), &vec![1, 2]);
    }
}
