pub mod instagram;

pub use instagram::InstagramAdapter;
