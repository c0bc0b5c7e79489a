pub mod matching;
pub mod subtitle;
