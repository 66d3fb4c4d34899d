//! Control protocol tests against the simulated control channel

use driver::sim::{SIMULATED_MODEL, SimulatedBulk, SimulatedControl};
use driver::{DeviceControl, DeviceOptions, DriverError, Fx3Device, TransportError};
use proptest::prelude::*;
use protocol::{Addressing, Command, EXPECTED_FIRMWARE, FirmwareVersion};

mod handshake {
    use super::*;

    #[test]
    fn test_matching_firmware_accepted() {
        let channel = SimulatedControl::new(EXPECTED_FIRMWARE);
        let log = channel.log();
        let mut control = DeviceControl::new(channel);

        let info = control.handshake(&EXPECTED_FIRMWARE).unwrap();
        assert_eq!(info.firmware, EXPECTED_FIRMWARE);
        assert_eq!(info.model, SIMULATED_MODEL);
        assert!(control.is_open());
        assert_eq!(log.count(Command::Reset), 0);
    }

    #[test]
    fn test_mismatch_sends_one_reset_and_closes() {
        let actual = FirmwareVersion::new(EXPECTED_FIRMWARE.major, EXPECTED_FIRMWARE.minor + 1);
        let channel = SimulatedControl::new(actual);
        let log = channel.log();
        let mut control = DeviceControl::new(channel);

        let err = control.handshake(&EXPECTED_FIRMWARE).unwrap_err();
        assert!(matches!(
            err,
            DriverError::FirmwareMismatch { expected, actual: a }
                if expected == EXPECTED_FIRMWARE && a == actual
        ));
        assert_eq!(log.count(Command::Reset), 1);
        assert!(!control.is_open());

        // Nothing else reaches the device afterwards
        assert!(matches!(
            control.handshake(&EXPECTED_FIRMWARE),
            Err(DriverError::SessionClosed)
        ));
        assert_eq!(log.count(Command::Reset), 1);
        assert_eq!(log.requests().len(), 2);
    }

    #[test]
    fn test_major_mismatch_rejected() {
        let channel = SimulatedControl::new(FirmwareVersion::new(EXPECTED_FIRMWARE.major + 1, 0));
        let log = channel.log();

        let result =
            Fx3Device::from_channels(channel, SimulatedBulk::new(), DeviceOptions::default());
        assert!(matches!(result, Err(DriverError::FirmwareMismatch { .. })));
        assert_eq!(log.count(Command::Reset), 1);
    }

    #[test]
    fn test_transport_failure_during_handshake() {
        let channel = SimulatedControl::new(EXPECTED_FIRMWARE);
        let log = channel.log();
        log.fail_next(TransportError::NoDevice);
        let mut control = DeviceControl::new(channel);

        assert!(matches!(
            control.handshake(&EXPECTED_FIRMWARE),
            Err(DriverError::Transport(TransportError::NoDevice))
        ));
        assert!(!control.is_open());
        assert_eq!(log.count(Command::Reset), 0);
    }

    #[test]
    fn test_debug_trace_default_follows_build() {
        assert_eq!(DeviceOptions::default().debug_trace, cfg!(debug_assertions));
    }
}

mod i2c {
    use super::*;

    #[test]
    fn test_read_restores_addressing() {
        let channel = SimulatedControl::new(EXPECTED_FIRMWARE);
        let log = channel.log();
        let mut control = DeviceControl::new(channel);

        control.set_argument(11, 0x0100).unwrap();
        let mut data = [0u8; 2];
        control.i2c_read(0xC0, 0x05, &mut data).unwrap();

        let read = log.last().unwrap();
        assert_eq!(read.setup.command, Command::I2cRead);
        assert_eq!(read.setup.addressing, Addressing::new(0xC0, 0x05));
        assert_eq!(read.read_len, 2);
        assert_eq!(control.addressing(), Addressing::new(0x0100, 11));
    }

    #[test]
    fn test_set_argument_after_read_is_exact() {
        let channel = SimulatedControl::new(EXPECTED_FIRMWARE);
        let log = channel.log();
        let mut control = DeviceControl::new(channel);

        let mut data = [0u8; 4];
        control.i2c_read(0xC0, 0x1A, &mut data).unwrap();
        control.set_argument(0x0004, 0x0230).unwrap();

        assert_eq!(control.addressing(), Addressing::new(0x0230, 0x0004));
        let request = log.last().unwrap();
        assert_eq!(request.setup.command, Command::SetArgument);
        assert_eq!(request.setup.addressing, Addressing::new(0x0230, 0x0004));
        assert_eq!(request.data, vec![0u8]);
    }

    #[test]
    fn test_failed_read_restores_addressing() {
        let channel = SimulatedControl::new(EXPECTED_FIRMWARE);
        let log = channel.log();
        let mut control = DeviceControl::new(channel);

        control.set_argument(3, 7).unwrap();
        log.fail_next(TransportError::Pipe);
        let mut data = [0u8; 1];
        assert!(control.i2c_read(0xC2, 0x10, &mut data).is_err());

        assert_eq!(control.addressing(), Addressing::new(7, 3));
        assert!(!control.is_open());
    }

    #[test]
    fn test_write_then_read_back() {
        let mut control = DeviceControl::new(SimulatedControl::new(EXPECTED_FIRMWARE));
        control.i2c_write(0xC0, 0x08, &[0xde, 0xad, 0xbe]).unwrap();

        let mut data = [0u8; 3];
        assert_eq!(control.i2c_read(0xC0, 0x08, &mut data).unwrap(), 3);
        assert_eq!(data, [0xde, 0xad, 0xbe]);
    }

    #[test]
    fn test_write_keeps_its_addressing() {
        let mut control = DeviceControl::new(SimulatedControl::new(EXPECTED_FIRMWARE));
        control.i2c_write(0xC0, 0x08, &[1]).unwrap();
        assert_eq!(control.addressing(), Addressing::new(0xC0, 0x08));
    }
}

mod commands {
    use super::*;

    #[test]
    fn test_typed_helpers_use_expected_codes_and_widths() {
        let channel = SimulatedControl::new(EXPECTED_FIRMWARE);
        let log = channel.log();
        let mut control = DeviceControl::new(channel);

        control.start_adc(64_000_000).unwrap();
        control.tuner_init(16_000_000).unwrap();
        control.tuner_tune(145_500_000).unwrap();
        control.set_gpio(0x0000_0400).unwrap();
        control.start_stream().unwrap();
        control.stop_stream().unwrap();
        control.tuner_standby().unwrap();
        let mut stats = [0u8; 16];
        control.get_stats(&mut stats).unwrap();
        control.reset_device().unwrap();

        let sent: Vec<(Command, usize)> = log
            .requests()
            .iter()
            .map(|r| (r.setup.command, r.data.len()))
            .collect();
        assert_eq!(
            sent,
            vec![
                (Command::StartAdc, 4),
                (Command::TunerInit, 4),
                (Command::TunerTune, 8),
                (Command::Gpio, 4),
                (Command::Start, 4),
                (Command::Stop, 4),
                (Command::TunerStandby, 4),
                (Command::GetStats, 0),
                (Command::Reset, 1),
            ]
        );
        assert!(
            log.requests()
                .iter()
                .all(|r| r.setup.addressing == Addressing::ZERO)
        );
    }

    #[test]
    fn test_closed_session_sends_nothing() {
        let channel = SimulatedControl::new(EXPECTED_FIRMWARE);
        let log = channel.log();
        let mut control = DeviceControl::new(channel);
        control.close();

        assert!(matches!(control.set_gpio(1), Err(DriverError::SessionClosed)));
        let mut buffer = [0u8; 8];
        assert!(matches!(
            control.read_debug_trace(&mut buffer),
            Err(DriverError::SessionClosed)
        ));
        assert!(log.requests().is_empty());
    }

    proptest! {
        #[test]
        fn prop_tune_frequency_little_endian(freq in any::<u64>()) {
            let channel = SimulatedControl::new(EXPECTED_FIRMWARE);
            let log = channel.log();
            let mut control = DeviceControl::new(channel);
            control.tuner_tune(freq).unwrap();

            let request = log.last().unwrap();
            prop_assert_eq!(request.setup.command, Command::TunerTune);
            prop_assert_eq!(request.data, freq.to_le_bytes().to_vec());
        }

        #[test]
        fn prop_set_argument_addressing(index in any::<u16>(), value in any::<u16>()) {
            let channel = SimulatedControl::new(EXPECTED_FIRMWARE);
            let log = channel.log();
            let mut control = DeviceControl::new(channel);
            control.set_argument(index, value).unwrap();

            let request = log.last().unwrap();
            prop_assert_eq!(request.setup.addressing, Addressing::new(value, index));
            prop_assert_eq!(request.data, vec![0u8]);
        }
    }
}
