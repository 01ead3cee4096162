pub mod aabox;
pub mod vec3;
