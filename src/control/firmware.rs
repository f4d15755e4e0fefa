use std::error::Error;
use std::fmt;
use std::io;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use crate::config::{ParseMode, Settings};
use crate::engine::{Arena, Engine, EngineError, Interpreter, TensorHandle, TENSOR_ARENA_SIZE};
use crate::parser::{IntegerListParser, ParseError, DEFAULT_DELIMITER, INT_ARRAY_SIZE};
use crate::quant::QuantizationAdapter;
use crate::serial::{LineBuffer, LineEvent, SerialPort, INPUT_BUFFER_SIZE};

/// Serial line ending for everything the firmware prints
const LINE_ENDING: &[u8] = b"\r\n";

/// Shortest pause after a serial I/O error
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Failures that stop the firmware before the loop starts
#[derive(Debug)]
pub enum StartupError {
    SchemaMismatch { expected: u32, found: u32 },
    InvalidModel(String),
    /// The model does not take 7 inputs and produce 1 output
    ShapeMismatch { input_len: usize, output_len: usize },
    ArenaExhausted { required: usize, capacity: usize },
    Engine(EngineError),
    Io(io::Error),
}

impl StartupError {
    /// Line written to the serial channel before halting
    pub fn diagnostic(&self) -> &'static str {
        match self {
            StartupError::SchemaMismatch { .. } => "Model schema version mismatch!",
            StartupError::InvalidModel(_) => "Model artifact invalid!",
            StartupError::ShapeMismatch { .. } => "Model shape mismatch!",
            StartupError::ArenaExhausted { .. } | StartupError::Engine(_) => "Tensor allocation failed!",
            StartupError::Io(_) => "Serial channel unavailable!",
        }
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StartupError::SchemaMismatch { expected, found } => write!(
                f, "Model schema version {} does not match runtime version {}", found, expected
            ),
            StartupError::InvalidModel(msg) => write!(f, "Invalid model: {}", msg),
            StartupError::ShapeMismatch { input_len, output_len } => write!(
                f, "Model maps {} inputs to {} outputs, expected {} to 1", input_len, output_len, INT_ARRAY_SIZE
            ),
            StartupError::ArenaExhausted { required, capacity } => write!(
                f, "Tensor arena of {} bytes cannot hold the {} bytes the model needs", capacity, required
            ),
            StartupError::Engine(e) => write!(f, "Engine error: {}", e),
            StartupError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl Error for StartupError {}

impl From<EngineError> for StartupError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::SchemaMismatch { expected, found } => StartupError::SchemaMismatch { expected, found },
            EngineError::InvalidModel(msg) => StartupError::InvalidModel(msg),
            EngineError::ArenaExhausted { required, capacity } => StartupError::ArenaExhausted { required, capacity },
            other => StartupError::Engine(other),
        }
    }
}

impl From<io::Error> for StartupError {
    fn from(err: io::Error) -> Self {
        StartupError::Io(err)
    }
}

/// Knobs for one firmware instance
#[derive(Debug, Clone)]
pub struct FirmwareOptions {
    pub banner: String,
    pub startup_delay: Duration,
    pub echo: bool,
    pub line_capacity: usize,
    pub delimiter: u8,
    pub parse_mode: ParseMode,
    pub arena_size: usize,
}

impl FirmwareOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            banner: settings.startup.banner.clone(),
            startup_delay: Duration::from_millis(settings.startup.delay_ms),
            echo: settings.serial.echo,
            line_capacity: settings.serial.line_capacity,
            // Validated as ASCII when settings load
            delimiter: u8::try_from(settings.parser.delimiter).unwrap_or(DEFAULT_DELIMITER),
            parse_mode: settings.parser.mode,
            arena_size: settings.model.arena_size,
        }
    }
}

impl Default for FirmwareOptions {
    fn default() -> Self {
        Self {
            banner: "Test Project waking up".to_string(),
            startup_delay: Duration::ZERO,
            echo: true,
            line_capacity: INPUT_BUFFER_SIZE,
            delimiter: DEFAULT_DELIMITER,
            parse_mode: ParseMode::Permissive,
            arena_size: TENSOR_ARENA_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Accumulating a line
    Idle,
    /// Validating, quantizing, invoking, reporting
    Processing,
}

/// Result of a successful inference
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceReport {
    pub values: [i32; INT_ARRAY_SIZE],
    pub quantized_output: i8,
    pub prediction: f32,
    pub print_time_us: u64,
    pub inference_time_us: u64,
}

/// How a complete command line was handled
#[derive(Debug)]
pub enum CommandOutcome {
    Predicted(InferenceReport),
    /// Not exactly seven values
    WrongCount { count: usize },
    /// Strict mode found a non-integer token
    InvalidToken(ParseError),
    InferenceFailed(EngineError),
}

/// What one `poll` did
#[derive(Debug)]
pub enum Step {
    /// Nothing was available on the serial channel
    NoInput,
    /// A byte was stored in the line buffer
    Accepted,
    /// The line buffer filled up and was discarded
    Overflow,
    /// A complete line was processed
    Completed(CommandOutcome),
}

/// Serial command ingestion plus the quantized inference adapter.
///
/// Owns every process-lifetime resource: the serial port, the line buffer
/// and the interpreter with its arena and fixed tensor handles.
pub struct Firmware<P: SerialPort, C: Clock> {
    port: P,
    clock: C,
    line: LineBuffer,
    parser: IntegerListParser,
    adapter: QuantizationAdapter,
    interpreter: Box<dyn Interpreter>,
    input: TensorHandle,
    output: TensorHandle,
    state: LoopState,
    echo: bool,
}

impl<P: SerialPort, C: Clock> Firmware<P, C> {
    /// Banner, model load, tensor allocation.
    ///
    /// On failure the diagnostic has already been written to `port`; the
    /// caller is expected to halt.
    pub fn start(
        engine: &dyn Engine,
        model_bytes: &[u8],
        options: &FirmwareOptions,
        mut port: P,
        clock: C,
    ) -> Result<Self, StartupError> {
        if !options.startup_delay.is_zero() {
            thread::sleep(options.startup_delay);
        }
        write_line(&mut port, &options.banner)?;
        info!("{} (engine: {})", options.banner, engine.name());

        match Self::bring_up(engine, model_bytes, options) {
            Ok((interpreter, input, output, adapter)) => Ok(Self {
                port,
                clock,
                line: LineBuffer::new(options.line_capacity),
                parser: IntegerListParser::new(options.delimiter, options.parse_mode),
                adapter,
                interpreter,
                input,
                output,
                state: LoopState::Idle,
                echo: options.echo,
            }),
            Err(e) => {
                error!("Startup failed: {}", e);
                write_line(&mut port, e.diagnostic())?;
                Err(e)
            }
        }
    }

    fn bring_up(
        engine: &dyn Engine,
        model_bytes: &[u8],
        options: &FirmwareOptions,
    ) -> Result<(Box<dyn Interpreter>, TensorHandle, TensorHandle, QuantizationAdapter), StartupError> {
        let model = engine.load(model_bytes)?;
        if model.input_len != INT_ARRAY_SIZE || model.output_len != 1 {
            return Err(StartupError::ShapeMismatch {
                input_len: model.input_len,
                output_len: model.output_len,
            });
        }
        let adapter = QuantizationAdapter::new(model.input, model.output);

        let interpreter = engine.allocate(model, Arena::new(options.arena_size))?;
        let input = interpreter.input_tensor(0)?;
        let output = interpreter.output_tensor(0)?;
        info!(
            "Tensors ready: input {} bytes @{}, output {} bytes @{}, arena {}/{} bytes",
            input.len, input.offset, output.len, output.offset,
            interpreter.arena_used(), interpreter.arena_capacity()
        );
        Ok((interpreter, input, output, adapter))
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// One loop iteration: read at most one byte and act on it. Returns
    /// immediately when no byte is pending.
    pub fn poll(&mut self) -> io::Result<Step> {
        let Some(byte) = self.port.read_byte()? else {
            return Ok(Step::NoInput);
        };
        if self.echo {
            self.port.write_bytes(&[byte])?;
        }

        match self.line.push(byte) {
            LineEvent::Continue => Ok(Step::Accepted),
            LineEvent::Overflow => {
                debug!("Line exceeded {} bytes without a terminator, discarded", self.line.capacity());
                self.port.flush()?;
                Ok(Step::Overflow)
            }
            LineEvent::LineReady(line) => {
                self.state = LoopState::Processing;
                let outcome = self.process_line(&line);
                self.state = LoopState::Idle;
                let outcome = outcome?;
                self.port.flush()?;
                Ok(Step::Completed(outcome))
            }
        }
    }

    /// Polls until the serial channel closes. With a zero backoff the loop
    /// busy-waits between bytes.
    ///
    /// Other I/O errors keep the loop alive but pause it for at least
    /// 10 ms; only the first of a run of errors is logged at warn.
    pub fn run(&mut self, idle_backoff: Duration) -> io::Result<()> {
        let mut consecutive_errors: u64 = 0;
        loop {
            match self.poll() {
                Ok(Step::NoInput) => {
                    consecutive_errors = 0;
                    if idle_backoff.is_zero() {
                        std::hint::spin_loop();
                    } else {
                        thread::sleep(idle_backoff);
                    }
                }
                Ok(_) => consecutive_errors = 0,
                Err(e) if matches!(e.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe) => {
                    info!("Serial channel closed: {}", e);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors == 1 {
                        warn!("Serial I/O error: {}", e);
                    } else {
                        debug!("Serial I/O error #{}: {}", consecutive_errors, e);
                    }
                    thread::sleep(idle_backoff.max(ERROR_BACKOFF));
                }
            }
        }
    }

    fn process_line(&mut self, line: &[u8]) -> io::Result<CommandOutcome> {
        self.println("Processing input...")?;

        let list = match self.parser.parse(line) {
            Ok(list) => list,
            Err(e) => {
                debug!("Rejected command: {}", e);
                self.println(&format!("Error: {}.", e))?;
                return Ok(CommandOutcome::InvalidToken(e));
            }
        };

        let Some(values) = list.complete().copied() else {
            debug!("Rejected command with {} values", list.count());
            self.println(&format!("Error: Please enter exactly {} numbers.", INT_ARRAY_SIZE))?;
            return Ok(CommandOutcome::WrongCount { count: list.count() });
        };

        self.println(&format_integers(&values))?;
        self.run_inference(values)
    }

    fn run_inference(&mut self, values: [i32; INT_ARRAY_SIZE]) -> io::Result<CommandOutcome> {
        let t0 = self.clock.micros();
        self.println("Running inference...")?;
        let t1 = self.clock.micros();

        let input = self.input;
        self.adapter.quantize_into(&values, self.interpreter.tensor_mut(&input));

        if let Err(e) = self.interpreter.invoke() {
            warn!("Inference failed for {:?}: {}", values, e);
            self.println("Inference failed!")?;
            return Ok(CommandOutcome::InferenceFailed(e));
        }
        let t2 = self.clock.micros();

        let quantized_output = self.interpreter.tensor(&self.output)[0];
        let prediction = self.adapter.dequantize(quantized_output);

        let report = InferenceReport {
            values,
            quantized_output,
            prediction,
            print_time_us: t1.saturating_sub(t0),
            inference_time_us: t2.saturating_sub(t1),
        };

        self.println(&format!("Prediction: {}", report.prediction))?;
        self.println(&format!(
            "Printing time = {} us. Inference time = {} us.",
            report.print_time_us, report.inference_time_us
        ))?;
        debug!("Prediction {} (q={}) for {:?}", prediction, quantized_output, values);

        Ok(CommandOutcome::Predicted(report))
    }

    fn println(&mut self, text: &str) -> io::Result<()> {
        write_line(&mut self.port, text)
    }
}

fn write_line<P: SerialPort>(port: &mut P, text: &str) -> io::Result<()> {
    port.write_bytes(text.as_bytes())?;
    port.write_bytes(LINE_ENDING)?;
    port.flush()
}

/// `Integers: [a, b, c]`
pub fn format_integers(values: &[i32]) -> String {
    let joined = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
    format!("Integers: [{}]", joined)
}

/// Stops all progress after a fatal startup error. Never returns.
pub fn halt() -> ! {
    error!("Halted");
    loop {
        thread::park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ManualClock;
    use crate::engine::fake::{seven_input_model_bytes, FakeEngine};
    use crate::serial::MemoryPort;

    fn boot<'a>(port: &'a mut MemoryPort, clock: &'a ManualClock) -> Firmware<&'a mut MemoryPort, &'a ManualClock> {
        Firmware::start(&FakeEngine::new(), &seven_input_model_bytes(), &FirmwareOptions::default(), port, clock)
            .unwrap()
    }

    fn drain<P: SerialPort, C: Clock>(firmware: &mut Firmware<P, C>) -> Vec<Step> {
        let mut steps = Vec::new();
        loop {
            match firmware.poll().unwrap() {
                Step::NoInput => return steps,
                step => steps.push(step),
            }
        }
    }

    #[test]
    fn test_format_integers() {
        assert_eq!(format_integers(&[1, 2, 3, 4, 5, 6, 0]), "Integers: [1, 2, 3, 4, 5, 6, 0]");
        assert_eq!(format_integers(&[-1]), "Integers: [-1]");
    }

    #[test]
    fn test_banner_on_start() {
        let mut port = MemoryPort::new();
        let clock = ManualClock::new(0, 1);
        let firmware = boot(&mut port, &clock);
        assert_eq!(firmware.state(), LoopState::Idle);
        drop(firmware);
        assert_eq!(port.output_lossy(), "Test Project waking up\r\n");
    }

    #[test]
    fn test_poll_without_input_is_a_no_op() {
        let mut port = MemoryPort::new();
        let clock = ManualClock::new(0, 1);
        let mut firmware = boot(&mut port, &clock);
        firmware.port_mut().take_output();
        assert!(matches!(firmware.poll().unwrap(), Step::NoInput));
        assert!(firmware.port().output().is_empty());
    }

    #[test]
    fn test_timing_uses_clock() {
        let mut port = MemoryPort::new();
        let clock = ManualClock::new(1_000, 7);
        let mut firmware = boot(&mut port, &clock);
        firmware.port_mut().feed(b"1,2,3,4,5,6,0\r");

        let steps = drain(&mut firmware);
        match steps.last() {
            Some(Step::Completed(CommandOutcome::Predicted(report))) => {
                assert_eq!(report.print_time_us, 7);
                assert_eq!(report.inference_time_us, 7);
                assert_eq!(report.values, [1, 2, 3, 4, 5, 6, 0]);
            }
            other => panic!("unexpected final step {:?}", other),
        }
        assert!(firmware.port().output_lossy().contains("Printing time = 7 us. Inference time = 7 us.\r\n"));
    }

    #[test]
    fn test_echo_disabled() {
        let mut port = MemoryPort::new();
        let clock = ManualClock::new(0, 1);
        let options = FirmwareOptions { echo: false, ..FirmwareOptions::default() };
        let mut firmware = Firmware::start(&FakeEngine::new(), &seven_input_model_bytes(), &options, &mut port, &clock)
            .unwrap();
        firmware.port_mut().take_output();
        firmware.port_mut().feed(b"1,2\r");
        drain(&mut firmware);
        let out = firmware.port().output_lossy();
        assert!(out.starts_with("Processing input...\r\n"), "{:?}", out);
    }

    /// Fails every read with `kind` a fixed number of times, then closes
    struct FailingPort {
        failures: usize,
        kind: io::ErrorKind,
        inner: MemoryPort,
    }

    impl SerialPort for FailingPort {
        fn read_byte(&mut self) -> io::Result<Option<u8>> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::new(self.kind, "device error"));
            }
            self.inner.read_byte()
        }

        fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.inner.write_bytes(bytes)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    #[test]
    fn test_run_backs_off_on_persistent_io_errors() {
        let mut inner = MemoryPort::with_input(b"1,2,3,4,5,6,0\r");
        inner.close();
        let port = FailingPort { failures: 3, kind: io::ErrorKind::Other, inner };
        let clock = ManualClock::new(0, 1);
        let mut firmware =
            Firmware::start(&FakeEngine::new(), &seven_input_model_bytes(), &FirmwareOptions::default(), port, &clock)
                .unwrap();

        let started = std::time::Instant::now();
        firmware.run(Duration::ZERO).unwrap();
        assert!(started.elapsed() >= ERROR_BACKOFF * 3);
        assert_eq!(firmware.port().failures, 0);
        assert!(firmware.port().inner.output_lossy().contains("Prediction: 3\r\n"));
    }

    #[test]
    fn test_startup_errors_map_to_diagnostics() {
        let err = StartupError::from(EngineError::SchemaMismatch { expected: 3, found: 2 });
        assert_eq!(err.diagnostic(), "Model schema version mismatch!");
        let err = StartupError::from(EngineError::ArenaExhausted { required: 64, capacity: 32 });
        assert_eq!(err.diagnostic(), "Tensor allocation failed!");
        let err = StartupError::from(EngineError::InvalidModel("x".into()));
        assert_eq!(err.diagnostic(), "Model artifact invalid!");
    }
}
