pub mod bitstream;
pub mod interest;
pub mod packet;
pub mod protocol;
pub mod replica;
pub mod schema;
pub mod schemas;
pub mod transport;
