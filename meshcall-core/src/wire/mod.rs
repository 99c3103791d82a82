//! Wire formats shared by the client core and the server: the TCP control
//! frame (§4.1), the JSON packet body document (§4.4), and the UDP media
//! datagram header (§4.2).

pub mod datagram;
pub mod frame;
pub mod packet;

pub use datagram::{DatagramHeader, DATAGRAM_HEADER_LEN};
pub use frame::{
    handshake_as_acceptor, handshake_as_connector, read_frame, write_frame, MAX_BODY_SIZE,
};
pub use packet::{
    ControlPacket, PacketBody, PacketType, MEDIA_TYPE_CAMERA, MEDIA_TYPE_SCREEN, MEDIA_TYPE_VOICE,
};
