pub mod config;
pub mod corpus;
pub mod decoding;
pub mod error;
pub mod features;
pub mod labels;
pub mod model;
pub mod pipeline;
pub mod types;

pub use config::SequencerConfig;
pub use error::SequencerError;
pub use labels::{LabelList, OutputSizePolicy, SilentLabelPolicy};
pub use pipeline::builder::SequencerBuilder;
pub use pipeline::bundle::TrainedModel;
pub use pipeline::runtime::{LabelingReport, SequenceInput, Sequencer};
pub use pipeline::traits::{BoundaryDetector, SegmentDecoder};
pub use types::{LabelPair, LabeledSequence, Note, Sequence, SoundInterval, StftParam};
