// Data models for the KTalk platform API

pub mod ktalk;
