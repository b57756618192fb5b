use comm_overlapped::sys::sim::Sim;
use comm_overlapped::sys::{
    NativeDcb, FILE_FLAG_OVERLAPPED, GENERIC_READ, GENERIC_WRITE, OPEN_EXISTING,
};
use comm_overlapped::{
    size_of_config_block, ControlChars, Device, DtrControl, Error, ErrorCode, Kernel, LineConfig,
    LineFlags, Parity, Reserved, RtsControl, StopBits,
};

fn open(sim: &Sim) -> Device {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::from(sim.clone())
        .open(
            "COM1",
            GENERIC_READ | GENERIC_WRITE,
            0,
            OPEN_EXISTING,
            FILE_FLAG_OVERLAPPED,
        )
        .unwrap()
}

fn sample() -> LineConfig {
    let mut config = LineConfig::default();
    config.baud_rate = 57_600;
    config.byte_size = 7;
    config.parity = Parity::Mark;
    config.stop_bits = StopBits::Two;
    config.dtr_control = DtrControl::Handshake;
    config.rts_control = RtsControl::Toggle;
    config.flags.parity_check = true;
    config.flags.xon_xoff_in = true;
    config.flags.null_strip = true;
    config.chars.eof = 0x1a;
    config.chars.event = b'\n';
    config.xon_limit = 100;
    config.xoff_limit = 200;
    config
}

#[test]
fn block_size_matches_native_layout() {
    assert_eq!(size_of_config_block(), 28);
    assert_eq!(std::mem::size_of::<NativeDcb>(), 28);
}

#[test]
fn written_config_reads_back_equal() {
    let sim = Sim::new();
    sim.add_device("COM1");
    let dev = open(&sim);

    let config = sample();
    dev.write_config(&config).unwrap();
    assert_eq!(dev.read_config().unwrap(), config);
}

/// Configurations the device accepts, each differing from the default in
/// one respect.
fn variants() -> Vec<LineConfig> {
    let base = LineConfig::default();
    let mut all = Vec::new();

    for &parity in [
        Parity::None,
        Parity::Odd,
        Parity::Even,
        Parity::Mark,
        Parity::Space,
    ]
    .iter()
    {
        all.push(LineConfig {
            parity,
            ..base.clone()
        });
    }

    // 1.5 stop bits only go with 5 data bits, 2 stop bits never do.
    for &(byte_size, stop_bits) in [
        (8, StopBits::One),
        (5, StopBits::OnePointFive),
        (8, StopBits::Two),
    ]
    .iter()
    {
        all.push(LineConfig {
            byte_size,
            stop_bits,
            ..base.clone()
        });
    }

    for byte_size in 4..=8 {
        all.push(LineConfig {
            byte_size,
            ..base.clone()
        });
    }

    for &dtr_control in [
        DtrControl::Disable,
        DtrControl::Enable,
        DtrControl::Handshake,
    ]
    .iter()
    {
        all.push(LineConfig {
            dtr_control,
            ..base.clone()
        });
    }

    for &rts_control in [
        RtsControl::Disable,
        RtsControl::Enable,
        RtsControl::Handshake,
        RtsControl::Toggle,
    ]
    .iter()
    {
        all.push(LineConfig {
            rts_control,
            ..base.clone()
        });
    }

    let switches: [fn(&mut LineFlags); 11] = [
        |f| f.binary = true,
        |f| f.parity_check = true,
        |f| f.cts_out_flow = true,
        |f| f.dsr_out_flow = true,
        |f| f.dsr_sensitivity = true,
        |f| f.tx_continue_on_xoff = true,
        |f| f.xon_xoff_out = true,
        |f| f.xon_xoff_in = true,
        |f| f.error_char_replace = true,
        |f| f.null_strip = true,
        |f| f.abort_on_error = true,
    ];
    for switch in switches.iter() {
        let mut flags = LineFlags::default();
        switch(&mut flags);
        all.push(LineConfig {
            flags,
            ..base.clone()
        });
    }

    for &limit in [0, 0xffff].iter() {
        all.push(LineConfig {
            xon_limit: limit,
            xoff_limit: limit,
            ..base.clone()
        });
    }

    for &c in [0, 0xff].iter() {
        all.push(LineConfig {
            chars: ControlChars {
                xon: c,
                xoff: c,
                error: c,
                eof: c,
                event: c,
            },
            ..base.clone()
        });
    }

    all.push(LineConfig {
        baud_rate: u32::max_value(),
        reserved: Reserved {
            dummy2: 0x1_ffff,
            w_reserved: 0xffff,
            w_reserved1: 0xffff,
        },
        ..base.clone()
    });
    all
}

#[test]
fn every_field_value_round_trips() {
    let sim = Sim::new();
    sim.add_device("COM1");
    let dev = open(&sim);

    for config in variants() {
        dev.write_config(&config).unwrap();
        assert_eq!(dev.read_config().unwrap(), config);
    }
}

#[test]
fn reserved_bits_survive_read_modify_write() {
    let sim = Sim::new();
    let port = sim.add_device("COM1");
    let mut block = port.config_block();
    block.bits |= 0x15 << 15;
    block.w_reserved = 0x1234;
    block.w_reserved1 = 0xabcd;
    port.set_config_block(block);

    let dev = open(&sim);
    let mut config = dev.read_config().unwrap();
    assert_eq!(config.reserved.dummy2, 0x15);
    config.baud_rate = 115_200;
    dev.write_config(&config).unwrap();

    let stored = port.config_block();
    assert_eq!(stored.bits >> 15, 0x15);
    assert_eq!(stored.w_reserved, 0x1234);
    assert_eq!(stored.w_reserved1, 0xabcd);
    assert_eq!(stored.baud_rate, 115_200);
    assert_eq!(dev.read_config().unwrap(), config);
}

#[test]
fn device_rejection_carries_the_captured_code() {
    let sim = Sim::new();
    sim.add_device("COM1");
    let dev = open(&sim);

    // Valid for the codec, rejected by the device.
    let mut config = LineConfig::default();
    config.byte_size = 5;
    config.stop_bits = StopBits::Two;
    match dev.write_config(&config) {
        Err(Error::Config { code }) => assert_eq!(code, ErrorCode::INVALID_PARAMETER),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(dev.read_config().unwrap(), LineConfig::default());
}

#[test]
fn invalid_byte_size_is_rejected_before_the_os() {
    let sim = Sim::new();
    let port = sim.add_device("COM1");
    let dev = open(&sim);
    let before = port.config_block();

    let mut config = LineConfig::default();
    config.byte_size = 9;
    match dev.write_config(&config) {
        Err(Error::InvalidConfig(msg)) => assert!(msg.contains("byte size")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(port.config_block(), before);
}
