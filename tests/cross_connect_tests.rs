//! Integration tests over the cross-connect harness.
//!
//! Each test attaches a [`SimBackplane`] wired like the physical harness and
//! walks one of the tables in `smartio_hal::fixture`, driving one end of a
//! wire and reading the other.

use approx::assert_abs_diff_eq;
use smartio_hal::{
    fixture, CounterEdge, Hal, HalConfig, PwmOutputPeriod, SimBackplane, WaitResult,
};
use std::thread;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_dio_cross_connects() {
    init_logging();
    let hal = Hal::new(HalConfig::default());
    let backplane = SimBackplane::new(&hal);

    for (input_channel, output_channel) in fixture::DIO_CROSS_CONNECTS {
        let input = hal
            .initialize_dio_port(input_channel as i32, true, "input")
            .unwrap();
        let output = hal
            .initialize_dio_port(output_channel as i32, false, "output")
            .unwrap();

        for level in [true, false, true, false] {
            hal.set_dio(output, level).unwrap();
            assert_eq!(
                hal.get_dio(input).unwrap(),
                level,
                "DIO {} -> {}",
                output_channel,
                input_channel
            );
            // An output reads back its own level.
            assert_eq!(hal.get_dio(output).unwrap(), level);
            assert_eq!(backplane.wire_level(input_channel), level);
        }

        hal.free_dio_port(output);
        hal.free_dio_port(input);
    }
}

#[test]
fn test_direction_swap_on_one_wire() {
    init_logging();
    let hal = Hal::default();
    let _backplane = SimBackplane::new(&hal);
    let (a_channel, b_channel) = fixture::HARNESS_WIRES[2];
    let a = hal.initialize_dio_port(a_channel as i32, false, "a").unwrap();
    let b = hal.initialize_dio_port(b_channel as i32, true, "b").unwrap();
    hal.set_dio(a, true).unwrap();
    assert!(hal.get_dio(b).unwrap());

    hal.set_dio_direction(a, smartio_hal::DioDirection::Input)
        .unwrap();
    assert!(!hal.get_dio(b).unwrap());
    hal.set_dio_direction(b, smartio_hal::DioDirection::Output)
        .unwrap();
    hal.set_dio(b, true).unwrap();
    assert!(hal.get_dio(a).unwrap());
}

#[test]
fn test_relay_cross_connects() {
    init_logging();
    let hal = Hal::default();
    let _backplane = SimBackplane::new(&hal);

    for (relay, forward_channel, reverse_channel) in fixture::RELAY_CROSS_CONNECTS {
        let forward = hal.initialize_relay_port(relay as i32, true, "fwd").unwrap();
        let reverse = hal
            .initialize_relay_port(relay as i32, false, "rev")
            .unwrap();
        let forward_input = hal
            .initialize_dio_port(forward_channel as i32, true, "fwd input")
            .unwrap();
        let reverse_input = hal
            .initialize_dio_port(reverse_channel as i32, true, "rev input")
            .unwrap();

        for (fwd, rev) in [(true, false), (false, true), (true, true), (false, false)] {
            hal.set_relay(forward, fwd).unwrap();
            hal.set_relay(reverse, rev).unwrap();
            assert_eq!(hal.get_relay(forward).unwrap(), fwd);
            assert_eq!(hal.get_relay(reverse).unwrap(), rev);
            assert_eq!(hal.get_dio(forward_input).unwrap(), fwd, "relay {} fwd", relay);
            assert_eq!(hal.get_dio(reverse_input).unwrap(), rev, "relay {} rev", relay);
        }

        // Freeing turns the half off.
        hal.set_relay(forward, true).unwrap();
        assert!(hal.get_dio(forward_input).unwrap());
        hal.free_relay_port(forward);
        assert!(!hal.get_dio(forward_input).unwrap());

        hal.free_relay_port(reverse);
        hal.free_dio_port(forward_input);
        hal.free_dio_port(reverse_input);
    }
}

#[test]
fn test_counter_cross_connects() {
    init_logging();
    let hal = Hal::default();
    let _backplane = SimBackplane::new(&hal);

    for (counter_channel, output_channel) in fixture::COUNTER_CROSS_CONNECTS {
        for edge in [CounterEdge::Rising, CounterEdge::Falling] {
            let output = hal
                .initialize_dio_port(output_channel as i32, false, "output")
                .unwrap();
            let counter = hal
                .initialize_counter(counter_channel as i32, edge, "counter")
                .unwrap();
            assert_eq!(hal.get_counter(counter).unwrap(), 0);

            for pulse in 1..=5 {
                hal.set_dio(output, true).unwrap();
                hal.set_dio(output, false).unwrap();
                assert_eq!(
                    hal.get_counter(counter).unwrap(),
                    pulse,
                    "counter {} ({:?})",
                    counter_channel,
                    edge
                );
            }
            // A rising edge alone only counts for a rising counter.
            hal.set_dio(output, true).unwrap();
            let expected = if edge == CounterEdge::Rising { 6 } else { 5 };
            assert_eq!(hal.get_counter(counter).unwrap(), expected);

            hal.free_counter(counter);
            hal.free_dio_port(output);
        }
    }
}

#[test]
fn test_pwm_to_duty_cycle() {
    init_logging();
    let hal = Hal::default();
    let _backplane = SimBackplane::new(&hal);
    let (pwm_channel, input_channel) = fixture::PWM_CROSS_CONNECTS[0];

    let pwm = hal.initialize_pwm_port(pwm_channel as i32, "pwm").unwrap();
    let duty = hal
        .initialize_duty_cycle(input_channel as i32, "duty")
        .unwrap();
    hal.set_pwm_output_period(pwm, PwmOutputPeriod::Multiplier1x)
        .unwrap();
    hal.set_pwm_pulse_time_microseconds(pwm, 1500).unwrap();

    // Several cycles of 5.05 ms.
    thread::sleep(Duration::from_millis(100));
    let high = hal.get_duty_cycle_high_time_microseconds(duty).unwrap();
    let period = hal.get_duty_cycle_period_microseconds(duty).unwrap();
    assert!(high.abs_diff(1500) <= 10, "high time {} us", high);
    assert!(period.abs_diff(5050) <= 10, "period {} us", period);
    assert_abs_diff_eq!(
        hal.get_duty_cycle_output(duty).unwrap(),
        1500.0 / 5050.0,
        epsilon = 0.01
    );

    hal.free_duty_cycle(duty);
    hal.free_pwm_port(pwm);
}

#[test]
fn test_analog_injection() {
    init_logging();
    let hal = Hal::default();
    let backplane = SimBackplane::new(&hal);
    let analog = hal.initialize_analog_input_port(30, "analog").unwrap();
    assert_eq!(hal.get_analog_value(analog).unwrap(), 0);

    backplane.set_analog_input(30, 2048);
    assert_eq!(hal.get_analog_value(analog).unwrap(), 2048);
    assert_abs_diff_eq!(
        hal.get_analog_voltage(analog).unwrap(),
        2048.0 * 3.3 / 4095.0,
        epsilon = 1e-9
    );
    backplane.set_analog_input(30, 4095);
    assert_abs_diff_eq!(hal.get_analog_voltage(analog).unwrap(), 3.3, epsilon = 1e-9);
}

#[test]
fn test_interrupt_over_wire() {
    init_logging();
    let hal = Hal::default();
    let _backplane = SimBackplane::new(&hal);
    let (input_channel, output_channel) = fixture::DIO_CROSS_CONNECTS[0];
    let input = hal
        .initialize_dio_port(input_channel as i32, true, "input")
        .unwrap();
    let output = hal
        .initialize_dio_port(output_channel as i32, false, "output")
        .unwrap();

    let irq = hal.initialize_interrupts().unwrap();
    hal.request_interrupts(irq, &input).unwrap();
    hal.set_interrupt_up_source_edge(irq, true, true).unwrap();

    let before = hal.fpga_time_us();
    hal.set_dio(output, true).unwrap();
    assert_eq!(
        hal.wait_for_interrupt(irq, Duration::from_millis(500), false)
            .unwrap(),
        WaitResult::RisingEdge
    );
    let rising = hal.read_interrupt_rising_timestamp(irq).unwrap();
    assert!(rising >= before);

    hal.set_dio(output, false).unwrap();
    assert_eq!(
        hal.wait_for_interrupt(irq, Duration::from_millis(500), false)
            .unwrap(),
        WaitResult::FallingEdge
    );
    assert!(hal.read_interrupt_falling_timestamp(irq).unwrap() >= rising);

    assert_eq!(
        hal.wait_for_interrupt(irq, Duration::from_millis(20), false)
            .unwrap(),
        WaitResult::Timeout
    );
    hal.clean_interrupts(irq);
}

#[test]
fn test_backplane_detaches_on_drop() {
    init_logging();
    let hal = Hal::default();
    let (input_channel, output_channel) = fixture::DIO_CROSS_CONNECTS[4];
    let input = hal
        .initialize_dio_port(input_channel as i32, true, "input")
        .unwrap();
    let output = hal
        .initialize_dio_port(output_channel as i32, false, "output")
        .unwrap();
    {
        let _backplane = SimBackplane::new(&hal);
        hal.set_dio(output, true).unwrap();
        assert!(hal.get_dio(input).unwrap());
        hal.set_dio(output, false).unwrap();
    }
    // With no firmware nothing answers on the input.
    hal.set_dio(output, true).unwrap();
    assert!(!hal.get_dio(input).unwrap());
}
