pub mod constants;
pub mod entity;
pub mod game_loop;
pub mod id_alloc;
pub mod input_buffer;
pub mod performance;
pub mod session;
pub mod spatial;
pub mod systems;
pub mod world;
