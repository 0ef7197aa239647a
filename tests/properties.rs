//! Property tests: random edit sessions checked against a simple model of
//! the history (contiguous sequences, undo as inverse, idempotent restore).

use proptest::prelude::*;
use retouch::testing::{fake_image, FakeTransformer};
use retouch::{
    Dimensions, Engine, EngineConfig, EngineError, FlipAxis, ImageFormat, Operation, Sequence,
    StaticProfiles,
};
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Clone, Debug)]
enum Step {
    Rotate(i32),
    Flip(FlipAxis),
    Resize(u32, u32),
    Undo,
    Restore(prop::sample::Index),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        prop::sample::select(vec![90, 180, 270, -90]).prop_map(Step::Rotate),
        prop_oneof![Just(FlipAxis::Horizontal), Just(FlipAxis::Vertical)].prop_map(Step::Flip),
        (1u32..2000, 1u32..2000).prop_map(|(w, h)| Step::Resize(w, h)),
        Just(Step::Undo),
        any::<prop::sample::Index>().prop_map(Step::Restore),
    ]
}

/// Expected log shape: each entry's parent and dimensions, plus the cursor.
struct Model {
    entries: Vec<(Option<usize>, Dimensions)>,
    cursor: usize,
}

impl Model {
    fn new(dimensions: Dimensions) -> Self {
        Self {
            entries: vec![(None, dimensions)],
            cursor: 0,
        }
    }

    fn current(&self) -> Dimensions {
        self.entries[self.cursor].1
    }

    fn append(&mut self, dimensions: Dimensions) {
        self.entries.push((Some(self.cursor), dimensions));
        self.cursor = self.entries.len() - 1;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_history_matches_model(steps in prop::collection::vec(step(), 1..16)) {
        let dir = TempDir::new().unwrap();
        let engine = Engine::create(
            EngineConfig::at(dir.path().join("engine")),
            Arc::new(FakeTransformer::new()),
            Arc::new(StaticProfiles::system_defaults()),
        )
        .unwrap();
        let session = engine.create_session().unwrap();
        let image = engine
            .upload(&session.id, "p.jpg", &fake_image(ImageFormat::Jpeg, 1200, 800))
            .unwrap();
        let mut model = Model::new(image.dimensions);

        for step in steps {
            match step {
                Step::Rotate(degrees) => {
                    let before = model.current();
                    let after = if degrees % 180 == 0 {
                        before
                    } else {
                        Dimensions::new(before.height, before.width)
                    };
                    let result = engine
                        .apply_operation(image.id, Operation::rotate(degrees).unwrap())
                        .unwrap();
                    model.append(after);
                    prop_assert_eq!(result.current_sequence, Sequence(model.cursor as u64));
                }
                Step::Flip(axis) => {
                    let result = engine
                        .apply_operation(image.id, Operation::flip(axis))
                        .unwrap();
                    model.append(model.current());
                    prop_assert_eq!(result.current_sequence, Sequence(model.cursor as u64));
                }
                Step::Resize(width, height) => {
                    engine
                        .apply_operation(image.id, Operation::resize(width, height).unwrap())
                        .unwrap();
                    model.append(Dimensions::new(width, height));
                }
                Step::Undo => match model.entries[model.cursor].0 {
                    Some(parent) => {
                        let history = engine.get_history(image.id).unwrap();
                        let undone = engine.undo(image.id).unwrap();
                        model.cursor = parent;
                        // The exact revision the edit was made from, not a copy
                        prop_assert_eq!(undone.current, history[parent].revision.key);
                        prop_assert_eq!(undone.thumbnail, history[parent].thumbnail.key);
                    }
                    None => {
                        let result = engine.undo(image.id);
                        prop_assert!(matches!(result, Err(EngineError::NothingToUndo(_))));
                    }
                },
                Step::Restore(index) => {
                    let target = index.index(model.entries.len());
                    let first = engine
                        .restore_to_sequence(image.id, Sequence(target as u64))
                        .unwrap();
                    let second = engine
                        .restore_to_sequence(image.id, Sequence(target as u64))
                        .unwrap();
                    prop_assert_eq!(first.current, second.current);
                    prop_assert_eq!(first.thumbnail, second.thumbnail);
                    model.cursor = target;
                }
            }

            let current = engine.get_image(image.id).unwrap();
            let history = engine.get_history(image.id).unwrap();
            prop_assert_eq!(history.len(), model.entries.len());
            for (i, entry) in history.iter().enumerate() {
                prop_assert_eq!(entry.sequence, Sequence(i as u64));
                prop_assert_eq!(entry.parent.map(|p| p.0 as usize), model.entries[i].0);
            }
            prop_assert_eq!(current.current_sequence, Sequence(model.cursor as u64));
            prop_assert_eq!(current.dimensions, model.current());
            prop_assert_eq!(current.current, history[model.cursor].revision.key);
            prop_assert_eq!(current.thumbnail, history[model.cursor].thumbnail.key);
            prop_assert_eq!(engine.can_undo(image.id).unwrap(), model.cursor > 0);
        }
    }
}
