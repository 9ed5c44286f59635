pub mod loaders;
pub mod stage;
pub mod task;

pub use loaders::{load_batch_input, BatchInput};
pub use stage::Stage;
pub use task::{
    dedupe_item_ids, BatchError, GradeResult, GradingContext, Identity, Item, ItemStatus, Preview, Recognition,
    SourceRef, StageCounts, StageOutput, StageState, Task, TaskConfig, TaskEvent, TaskStatus,
};
