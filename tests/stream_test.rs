#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use rfstream::block::{BlockPort, StreamCmd, StreamSignature};
    use rfstream::chdr::{
        wire_format, Endianness, HeaderFlags, PacketHeader, PacketType, MAX_HEADER_WORDS,
    };
    use rfstream::link::{ChannelLink, DataLink, LinkConfig};
    use rfstream::{
        ChannelSpec, EndpointId, Error, LoopbackProvider, Result, StreamAddress, StreamArgs,
        StreamDevice,
    };

    /// Minimal radio-like block: packetizing, flow-control programmable.
    struct MockRadio {
        name: String,
        endpoint: EndpointId,
        spp: Mutex<usize>,
        fifo: usize,
        active: AtomicBool,
        fc_out_window: Mutex<Option<usize>>,
        fc_in_interval: Mutex<Option<usize>>,
    }

    impl MockRadio {
        fn new(name: &str, endpoint: EndpointId, spp: usize) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                endpoint,
                spp: Mutex::new(spp),
                fifo: 65536,
                active: AtomicBool::new(false),
                fc_out_window: Mutex::new(None),
                fc_in_interval: Mutex::new(None),
            })
        }

        fn current_spp(&self) -> usize {
            *self.spp.lock().unwrap()
        }
    }

    impl BlockPort for MockRadio {
        fn block_id(&self) -> String {
            self.name.clone()
        }
        fn device_index(&self) -> usize {
            self.endpoint.device as usize
        }
        fn address(&self, _port: usize) -> Result<EndpointId> {
            Ok(self.endpoint)
        }
        fn stream_signature(&self, _port: usize) -> StreamSignature {
            StreamSignature {
                item_type: "sc16".into(),
                packet_size: None,
            }
        }
        fn fifo_bytes(&self, _port: usize) -> usize {
            self.fifo
        }
        fn configure_flow_control_out(
            &self,
            _enable: bool,
            window_pkts: usize,
            _pkt_limit: usize,
            _port: usize,
        ) -> Result<()> {
            *self.fc_out_window.lock().unwrap() = Some(window_pkts);
            Ok(())
        }
        fn configure_flow_control_in(&self, interval_pkts: usize, _port: usize) -> Result<()> {
            *self.fc_in_interval.lock().unwrap() = Some(interval_pkts);
            Ok(())
        }
        fn issue_stream_cmd(&self, _cmd: StreamCmd, _port: usize) -> Result<()> {
            Ok(())
        }
        fn set_active_streamer(&self, active: bool, _port: usize) {
            self.active.store(active, Ordering::SeqCst);
        }
        fn samples_per_packet(&self) -> Option<usize> {
            Some(*self.spp.lock().unwrap())
        }
        fn set_samples_per_packet(&self, spp: usize) -> Result<()> {
            *self.spp.lock().unwrap() = spp;
            Ok(())
        }
    }

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// 8 KiB frames, 32 deep: 256 KiB of buffering per direction.
    fn link_config() -> LinkConfig {
        LinkConfig {
            send_frame_words: 2048,
            recv_frame_words: 2048,
            num_send_frames: 32,
            num_recv_frames: 32,
        }
    }

    fn make_device(budget: usize) -> (StreamDevice, Arc<LoopbackProvider>) {
        let provider = Arc::new(LoopbackProvider::new(
            link_config(),
            Endianness::Big,
            budget,
        ));
        let device = StreamDevice::new(provider.clone(), Endianness::Big, 1);
        (device, provider)
    }

    /// Routes are allocated in order; the n-th transport gets host
    /// crossbar port n.
    fn nth_route(n: u8, endpoint: EndpointId) -> StreamAddress {
        StreamAddress::new(EndpointId::new(endpoint.device, n, 0), endpoint)
    }

    fn push_data(device_end: &ChannelLink, seq: u32, payload_words: u16) {
        let wire = wire_format(Endianness::Big);
        let mut buf = device_end.acquire_send(Duration::ZERO).unwrap();
        let mut header = PacketHeader::new(PacketType::Data);
        header.sequence_number = seq;
        header.num_payload_words = payload_words;
        let n = wire.pack(buf.words_mut(), &header).unwrap();
        buf.commit(n + payload_words as usize);
    }

    #[test]
    fn test_rx_stream_end_to_end_with_flow_control() -> anyhow::Result<()> {
        init_logging();
        let (device, provider) = make_device(8);
        let endpoint = EndpointId::new(0, 2, 0);
        // spp 2045 makes the full packet exactly one 8192-byte frame.
        let radio = MockRadio::new("0/Radio_0", endpoint, 2045);
        let idx = device.register_block(radio.clone());

        let mut args = StreamArgs::new("sc16", "sc16", vec![ChannelSpec { block: idx, port: 0 }]);
        args.args.insert("recv_buff_fullness".into(), "1.0".into());
        args.args.insert("rx_fc_request_freq".into(), "8".into());
        let streamer = device.get_rx_stream(&args)?;
        assert_eq!(streamer.samples_per_packet(), 2045);

        // Window: 256 KiB buffer / 8192-byte packets = 32 packets.
        assert_eq!(*radio.fc_out_window.lock().unwrap(), Some(32));

        let device_end = provider.device_end(nth_route(0, endpoint)).unwrap();
        // interval = (262144 - 8192) / 8 = 31744 bytes; payload per packet
        // is 2045 words = 8180 bytes, so the report is due on packet 4.
        for seq in 0..4u32 {
            push_data(&device_end, seq, 2045);
        }
        for _ in 0..3 {
            let p = streamer.recv_packet(0, Duration::from_secs(1))?;
            assert!(!p.sequence_error);
            assert!(device_end.acquire_recv(Duration::ZERO).is_none());
        }
        let _ = streamer.recv_packet(0, Duration::from_secs(1))?;

        let wire = wire_format(Endianness::Big);
        let fc = device_end
            .acquire_recv(Duration::from_secs(1))
            .expect("flow control report due");
        let header = wire.unpack(fc.words())?;
        assert_eq!(header.packet_type, PacketType::FlowControl);
        let payload = &fc.words()[header.num_header_words()..];
        assert_eq!(wire.to_host(payload[0]), 4); // packets consumed
        assert_eq!(wire.to_host(payload[1]), 4 * 8180); // bytes consumed

        // First receive flipped the radio active.
        assert!(radio.active.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_spp_negotiation_is_global_minimum() -> anyhow::Result<()> {
        let (device, _provider) = make_device(8);
        let r0 = MockRadio::new("0/Radio_0", EndpointId::new(0, 2, 0), 512);
        let r1 = MockRadio::new("0/Radio_1", EndpointId::new(0, 3, 0), 256);
        let r2 = MockRadio::new("0/Radio_2", EndpointId::new(0, 4, 0), 1024);
        let channels = vec![
            ChannelSpec { block: device.register_block(r0.clone()), port: 0 },
            ChannelSpec { block: device.register_block(r1.clone()), port: 0 },
            ChannelSpec { block: device.register_block(r2.clone()), port: 0 },
        ];

        let args = StreamArgs::new("sc16", "sc16", channels);
        let streamer = device.get_rx_stream(&args)?;

        assert_eq!(streamer.samples_per_packet(), 256);
        // The minimum is written back to every radio.
        assert_eq!(r0.current_spp(), 256);
        assert_eq!(r1.current_spp(), 256);
        assert_eq!(r2.current_spp(), 256);
        Ok(())
    }

    #[test]
    fn test_zero_channels_rejected() {
        let (device, _provider) = make_device(8);
        let args = StreamArgs::new("sc16", "sc16", vec![]);
        assert!(matches!(
            device.get_rx_stream(&args),
            Err(Error::Value(_))
        ));
        assert!(matches!(
            device.get_tx_stream(&args),
            Err(Error::Value(_))
        ));
    }

    #[test]
    fn test_signature_mismatch_names_block_and_channel() {
        let (device, _provider) = make_device(8);
        let radio = MockRadio::new("0/Radio_0", EndpointId::new(0, 2, 0), 512);
        let idx = device.register_block(radio);
        // Radio streams sc16; asking for sc8 on the wire cannot work.
        let args = StreamArgs::new("fc32", "sc8", vec![ChannelSpec { block: idx, port: 0 }]);
        match device.get_rx_stream(&args) {
            Err(Error::IncompatibleStreamSignature(msg)) => {
                assert!(msg.contains("sc8"));
            }
            Err(e) => panic!("wrong error kind: {e}"),
            Ok(_) => panic!("signature mismatch accepted"),
        }
    }

    #[test]
    fn test_transport_budget_exhaustion() {
        let (device, _provider) = make_device(0);
        let radio = MockRadio::new("0/Radio_0", EndpointId::new(0, 2, 0), 512);
        let idx = device.register_block(radio);
        let args = StreamArgs::new("sc16", "sc16", vec![ChannelSpec { block: idx, port: 0 }]);
        assert!(matches!(
            device.get_rx_stream(&args),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_undersized_transport_frames_rejected() {
        // Frames too small for even a full header cannot carry samples.
        let provider = Arc::new(LoopbackProvider::new(
            LinkConfig {
                send_frame_words: 2,
                recv_frame_words: 2,
                num_send_frames: 4,
                num_recv_frames: 4,
            },
            Endianness::Big,
            8,
        ));
        let device = StreamDevice::new(provider, Endianness::Big, 1);
        let radio = MockRadio::new("0/Radio_0", EndpointId::new(0, 2, 0), 512);
        let idx = device.register_block(radio);
        let args = StreamArgs::new("sc16", "sc16", vec![ChannelSpec { block: idx, port: 0 }]);
        match device.get_rx_stream(&args) {
            Err(Error::Value(msg)) => assert!(msg.contains("frame")),
            Err(e) => panic!("wrong error kind: {e}"),
            Ok(_) => panic!("undersized frames accepted"),
        }
    }

    #[test]
    fn test_weak_map_prunes_after_streamer_drop() -> anyhow::Result<()> {
        let (device, _provider) = make_device(8);
        let radio = MockRadio::new("0/Radio_0", EndpointId::new(0, 2, 0), 512);
        let idx = device.register_block(radio.clone());
        let args = StreamArgs::new("sc16", "sc16", vec![ChannelSpec { block: idx, port: 0 }]);

        let streamer = device.get_rx_stream(&args)?;
        assert_eq!(device.num_live_rx_streamers(), 1);
        device.update_rx_rate(1e6);
        assert_eq!(streamer.sample_rate(), 1e6);

        drop(streamer);
        // Rate pushes after drop are no-ops, not errors.
        device.update_rx_rate(2e6);
        assert_eq!(device.num_live_rx_streamers(), 0);
        // Teardown told the radio the streamer detached.
        assert!(!radio.active.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_tx_stream_end_to_end_with_credit() -> anyhow::Result<()> {
        init_logging();
        let (device, provider) = make_device(8);
        let endpoint = EndpointId::new(0, 2, 0);
        let radio = MockRadio::new("0/Radio_0", endpoint, 2045);
        let idx = device.register_block(radio.clone());

        let mut args = StreamArgs::new("sc16", "sc16", vec![ChannelSpec { block: idx, port: 0 }]);
        args.spp = Some(16);
        let streamer = device.get_tx_stream(&args)?;
        assert_eq!(streamer.samples_per_packet(), 16);
        assert!(radio.fc_in_interval.lock().unwrap().is_some());

        // Data goes over the first transport, async messages the second.
        let data_end = provider.device_end(nth_route(0, endpoint)).unwrap();

        let mut handle = streamer.get_send_buffer(0, 16, Duration::from_secs(1))?;
        for (i, w) in handle.payload_mut().iter_mut().enumerate() {
            *w = i as u32;
        }
        streamer.commit(handle, true, true)?;

        let wire = wire_format(Endianness::Big);
        let frame = data_end.acquire_recv(Duration::from_secs(1)).unwrap();
        let header = wire.unpack(frame.words())?;
        assert_eq!(header.packet_type, PacketType::Data);
        assert_eq!(header.num_payload_words, 16);
        assert!(header.flags.contains(HeaderFlags::END_OF_BURST));
        assert_eq!(frame.words()[MAX_HEADER_WORDS], 0);
        assert_eq!(frame.words()[MAX_HEADER_WORDS + 15], 15);
        Ok(())
    }

    #[test]
    fn test_tx_async_status_reaches_device_queue() -> anyhow::Result<()> {
        let (device, provider) = make_device(8);
        let endpoint = EndpointId::new(0, 2, 0);
        let radio = MockRadio::new("0/Radio_0", endpoint, 2045);
        let idx = device.register_block(radio);

        let mut args = StreamArgs::new("sc16", "sc16", vec![ChannelSpec { block: idx, port: 0 }]);
        args.spp = Some(16);
        let streamer = device.get_tx_stream(&args)?;

        let msg_end = provider.device_end(nth_route(1, endpoint)).unwrap();
        let wire = wire_format(Endianness::Big);
        let mut buf = msg_end.acquire_send(Duration::ZERO).unwrap();
        let mut header = PacketHeader::new(PacketType::Data);
        header.sequence_number = 11;
        header.num_payload_words = 1;
        let n = wire.pack(buf.words_mut(), &header)?;
        buf.words_mut()[n] = wire.from_host(0xE0);
        buf.commit(n + 1);

        let msg = streamer
            .recv_async_msg(Duration::from_secs(2))
            .expect("status message");
        assert_eq!(msg.sequence_number, 11);
        let legacy = device
            .recv_async_msg(Duration::from_secs(2))
            .expect("legacy queue copy");
        assert_eq!(legacy.sequence_number, 11);

        // Dropping the streamer joins the drain thread promptly even
        // though it is blocked in a receive wait.
        let start = std::time::Instant::now();
        drop(streamer);
        assert!(start.elapsed() < Duration::from_secs(2));
        Ok(())
    }
}
