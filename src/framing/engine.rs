use crate::framing::FramingProtocol;
use crate::io::pool::Pool;
use crate::network::socket::Socket;
use bytes::{Buf, BytesMut};

/// Configuration for [`packet_framing_handler`].
#[derive(Debug, Clone)]
pub struct FramingConfig {
    /// Size of the fixed read buffer each connection pumps data into
    /// (default: 4 KiB).
    pub read_buffer_size: usize,

    /// Maximal size of a packet; anything larger is silently dropped.
    /// `0` disables the cap (default: 16 KiB).
    pub max_packet_size: usize,

    /// Minimal free space in the read buffer required to fit another read
    /// into it without copying the pending fragment into an auxiliary buffer
    /// (default: 1 KiB, or 1/4 of `read_buffer_size` when larger than it).
    pub min_read_space: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 4 * 1024,
            max_packet_size: 16 * 1024,
            min_read_space: 1024,
        }
    }
}

impl FramingConfig {
    fn normalized(mut self) -> Self {
        if self.read_buffer_size == 0 {
            self.read_buffer_size = FramingConfig::default().read_buffer_size;
        }
        if self.min_read_space > self.read_buffer_size {
            self.min_read_space = self.read_buffer_size / 4;
        }
        self
    }
}

/// Builds a socket handler that reassembles the incoming byte stream into
/// whole packets according to `protocol` and invokes `packet_handler` for
/// each of them.
///
/// The handler is invoked synchronously on the connection's thread with a
/// slice borrowed from the connection's read buffer; it must not retain the
/// slice past return. On the fast path packets are extracted straight from
/// the read buffer without copying; a fragmented packet pays for one copy
/// into a pooled spill buffer only when the read buffer is too full to fit
/// another read.
pub fn packet_framing_handler<P, H>(
    protocol: P,
    packet_handler: H,
    config: FramingConfig,
) -> impl Fn(&Socket) + Send + Sync
where
    P: FramingProtocol + 'static,
    H: Fn(&Socket, &[u8]) + Send + Sync + 'static,
{
    let config = config.normalized();

    // buffers are pooled across connections to keep the hot path free of
    // allocations
    let read_buffer_size = config.read_buffer_size;
    let read_pool: Pool<Vec<u8>> = Pool::new(move || vec![0u8; read_buffer_size]);
    let spill_pool: Pool<BytesMut> = Pool::new(BytesMut::new);

    move |socket: &Socket| {
        let mut read_buffer = read_pool.get();
        let mut spill: Option<BytesMut> = None;

        // left marks the start of unprocessed data in the read buffer, right
        // the position the next read lands at; both are meaningful only while
        // the pending fragment lives in the read buffer
        let mut left = 0usize;
        let mut right = 0usize;

        loop {
            let n = match socket.read(&mut read_buffer[right..]) {
                Ok(0) if socket.is_closed() => break,
                Ok(n) => n,
                Err(_) => {
                    if socket.is_closed() {
                        break;
                    }
                    continue;
                }
            };

            if config.max_packet_size > 0 {
                let mut in_flight = right + n - left;
                if let Some(buffer) = spill.as_ref() {
                    in_flight += buffer.len();
                }

                if in_flight > config.max_packet_size {
                    // packet too big, drop it and start over
                    if let Some(buffer) = spill.as_mut() {
                        buffer.clear();
                    }
                    left = 0;
                    right = 0;
                    continue;
                }
            }

            // pull in the fragment left over from past iterations, if any
            let assembled: Option<BytesMut> = match spill.take() {
                Some(mut buffer) if !buffer.is_empty() => {
                    buffer.extend_from_slice(&read_buffer[left..right + n]);
                    left = 0;
                    right = 0;
                    Some(buffer)
                }
                other => {
                    spill = other;
                    None
                }
            };

            let mut source: &[u8] = match assembled.as_deref() {
                Some(buffer) => buffer,
                None => &read_buffer[left..right + n],
            };

            let fragment = loop {
                match protocol.extract_packet(source) {
                    Some((packet, rest)) => {
                        // fast path - the packet is handed out straight from
                        // the buffer it arrived in, without copying
                        if assembled.is_none() {
                            let excess = source.len() - packet.len() - rest.len();
                            left += packet.len() + excess;
                            right += packet.len() + excess;
                        }

                        packet_handler(socket, packet);
                        source = rest;
                    }
                    None => break source.len(),
                }
            };

            if fragment == 0 {
                left = 0;
                right = 0;
                if let Some(mut buffer) = assembled {
                    buffer.clear();
                    spill = Some(buffer);
                }
                continue;
            }

            match assembled {
                Some(mut buffer) => {
                    // the unconsumed tail stays in the spill buffer
                    let consumed = buffer.len() - fragment;
                    buffer.advance(consumed);
                    spill = Some(buffer);
                }
                None => {
                    if right + fragment > read_buffer.len() - config.min_read_space {
                        // slow path - not enough room for another read, copy
                        // the fragment out of the way
                        let buffer = spill.get_or_insert_with(|| spill_pool.get());
                        buffer.extend_from_slice(&read_buffer[left..left + fragment]);
                        left = 0;
                        right = 0;
                    } else {
                        // the fragment stays in place, the next read extends it
                        right = left + fragment;
                    }
                }
            }
        }

        read_pool.put(read_buffer);
        if let Some(mut buffer) = spill {
            buffer.clear();
            spill_pool.put(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{LengthPrefixedFraming, PrefixKind, SeparatorFraming};
    use crate::network::testing::MockStream;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn payload_with_separator(n: usize) -> Vec<u8> {
        let mut payload = vec![b'A'; n];
        payload.push(b'\n');
        payload
    }

    struct Capture {
        packets: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Capture {
        fn new() -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
            let packets = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    packets: Arc::clone(&packets),
                },
                packets,
            )
        }

        fn handler(self) -> impl Fn(&Socket, &[u8]) + Send + Sync + 'static {
            move |_socket, packet| self.packets.lock().push(packet.to_vec())
        }
    }

    fn run(stream: Arc<MockStream>, handler: impl Fn(&Socket) + Send + Sync) {
        let socket = Socket::new();
        socket.init(stream);
        handler(&socket);
    }

    #[test]
    fn single_packet() {
        let (capture, packets) = Capture::new();
        let handler = packet_framing_handler(
            SeparatorFraming::new(b"\n"),
            capture.handler(),
            FramingConfig::default(),
        );

        run(MockStream::new(payload_with_separator(128)), handler);

        let packets = packets.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], vec![b'A'; 128]);
    }

    #[test]
    fn two_packets_in_one_read() {
        let (capture, packets) = Capture::new();
        let handler = packet_framing_handler(
            SeparatorFraming::new(b"\n"),
            capture.handler(),
            FramingConfig::default(),
        );

        let mut data = payload_with_separator(128);
        data.extend_from_slice(&payload_with_separator(128));
        run(MockStream::new(data), handler);

        assert_eq!(packets.lock().len(), 2);
    }

    #[test]
    fn packet_fragmented_across_reads_spills() {
        let (capture, packets) = Capture::new();
        let handler = packet_framing_handler(
            SeparatorFraming::new(b"\n"),
            capture.handler(),
            FramingConfig {
                read_buffer_size: 512,
                min_read_space: 256,
                ..Default::default()
            },
        );

        // 1025 bytes of packet through a 512-byte read buffer
        run(MockStream::new(payload_with_separator(1024)), handler);

        let packets = packets.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], vec![b'A'; 1024]);
    }

    #[test]
    fn two_fragmented_packets() {
        let (capture, packets) = Capture::new();
        let handler = packet_framing_handler(
            SeparatorFraming::new(b"\n"),
            capture.handler(),
            FramingConfig {
                read_buffer_size: 768,
                min_read_space: 100,
                ..Default::default()
            },
        );

        let mut data = payload_with_separator(512);
        data.extend_from_slice(&payload_with_separator(512));
        run(MockStream::new(data), handler);

        let packets = packets.lock();
        assert_eq!(packets.len(), 2);
        assert!(packets.iter().all(|packet| *packet == vec![b'A'; 512]));
    }

    #[test]
    fn chunked_delivery_reassembles_packets() {
        let (capture, packets) = Capture::new();
        let handler = packet_framing_handler(
            SeparatorFraming::new(b"\n"),
            capture.handler(),
            FramingConfig::default(),
        );

        let mut data = payload_with_separator(128);
        data.extend_from_slice(&payload_with_separator(128));
        run(MockStream::with_schedule(data, vec![160, 200]), handler);

        assert_eq!(packets.lock().len(), 2);
    }

    #[test]
    fn every_chunk_schedule_yields_the_same_packets() {
        // frame boundaries never align with read boundaries
        let sizes = [1usize, 7, 64, 200];
        let mut data = Vec::new();
        for size in sizes {
            crate::io::codec::write_var_int(&mut data, size as i32).unwrap();
            data.extend_from_slice(&vec![b'x'; size]);
        }

        for chunk in [1usize, 2, 3, 5, 16, 1024] {
            let (capture, packets) = Capture::new();
            let handler = packet_framing_handler(
                LengthPrefixedFraming::new(PrefixKind::VarInt),
                capture.handler(),
                FramingConfig {
                    read_buffer_size: 64,
                    min_read_space: 16,
                    ..Default::default()
                },
            );

            let schedule = vec![chunk; data.len().div_ceil(chunk)];
            run(MockStream::with_schedule(data.clone(), schedule), handler);

            let packets = packets.lock();
            assert_eq!(packets.len(), sizes.len(), "chunk size {chunk}");
            for (packet, size) in packets.iter().zip(sizes) {
                assert_eq!(packet, &vec![b'x'; size], "chunk size {chunk}");
            }
        }
    }

    #[test]
    fn oversize_packet_is_dropped_later_packets_survive() {
        let (capture, packets) = Capture::new();
        let handler = packet_framing_handler(
            SeparatorFraming::new(b"\n"),
            capture.handler(),
            FramingConfig {
                max_packet_size: 512,
                ..Default::default()
            },
        );

        // the oversize packet arrives alone and is discarded wholesale; the
        // following packet arrives in a later read and goes through
        let mut data = payload_with_separator(1024);
        let boundary = data.len();
        data.extend_from_slice(&payload_with_separator(16));
        run(
            MockStream::with_schedule(data, vec![boundary]),
            handler,
        );

        let packets = packets.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], vec![b'A'; 16]);
    }

    #[test]
    fn fast_path_packets_are_subslices_of_one_buffer() {
        // two packets extracted from a single read must be adjacent slices of
        // the same read buffer: no copies were made
        let addresses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&addresses);

        let handler = packet_framing_handler(
            SeparatorFraming::new(b"\n"),
            move |_socket: &Socket, packet: &[u8]| {
                sink.lock().push((packet.as_ptr() as usize, packet.len()));
            },
            FramingConfig::default(),
        );

        run(MockStream::new(b"AB\nCD\n".to_vec()), handler);

        let addresses = addresses.lock();
        assert_eq!(addresses.len(), 2);
        let (first_ptr, first_len) = addresses[0];
        let (second_ptr, _) = addresses[1];
        assert_eq!(second_ptr, first_ptr + first_len + 1);
    }

    #[test]
    fn varint_framed_packet() {
        let (capture, packets) = Capture::new();
        let handler = packet_framing_handler(
            LengthPrefixedFraming::new(PrefixKind::VarInt),
            capture.handler(),
            FramingConfig::default(),
        );

        run(MockStream::new(b"\x05HELLO".to_vec()), handler);

        let packets = packets.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], b"HELLO");
    }

    #[test]
    fn truncated_varint_stalls_until_more_data() {
        let (capture, packets) = Capture::new();
        let handler = packet_framing_handler(
            LengthPrefixedFraming::new(PrefixKind::VarInt),
            capture.handler(),
            FramingConfig::default(),
        );

        // length byte arrives alone, body in the next read
        run(
            MockStream::with_schedule(b"\x03abc".to_vec(), vec![1, 3]),
            handler,
        );

        let packets = packets.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], b"abc");
    }
}
