//! Per-session input dispatcher

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::error::{InputError, Result};
use super::event::{ExtendedPointerFlags, InputEvent, KeyboardFlags, PointerFlags, WHEEL_DELTA};
use super::mapper::{unicode_to_keysym, ScancodeMapper};
use super::InputInjector;
use crate::backend::DesktopBackend;

/// X11 core pointer buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XButton {
    /// Button 1
    Left,
    /// Button 2
    Middle,
    /// Button 3
    Right,
    /// Button 4
    WheelUp,
    /// Button 5
    WheelDown,
    /// Button 6
    WheelLeft,
    /// Button 7
    WheelRight,
    /// Button 8
    Back,
    /// Button 9
    Forward,
}

impl XButton {
    /// X11 button number
    pub fn number(self) -> u8 {
        match self {
            XButton::Left => 1,
            XButton::Middle => 2,
            XButton::Right => 3,
            XButton::WheelUp => 4,
            XButton::WheelDown => 5,
            XButton::WheelLeft => 6,
            XButton::WheelRight => 7,
            XButton::Back => 8,
            XButton::Forward => 9,
        }
    }
}

/// Injection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputStats {
    /// Events injected successfully
    pub injected: u64,
    /// Events that failed
    pub failed: u64,
}

struct ActiveInjection {
    injector: Arc<dyn InputInjector>,
    held_keys: HashSet<u8>,
    held_keysyms: HashSet<u32>,
    held_buttons: HashSet<u8>,
}

struct DispatcherState {
    active: Option<ActiveInjection>,
    desktop: (u16, u16),
    stats: InputStats,
}

/// Routes RDP input events to an [`InputInjector`]
pub struct InputDispatcher {
    backend: Arc<dyn DesktopBackend>,
    mapper: ScancodeMapper,
    state: Mutex<DispatcherState>,
}

impl InputDispatcher {
    /// Create a stopped dispatcher
    pub fn new(backend: Arc<dyn DesktopBackend>) -> Self {
        let (width, height) = backend.desktop_size();
        Self {
            backend,
            mapper: ScancodeMapper::new(),
            state: Mutex::new(DispatcherState {
                active: None,
                desktop: (clamp_dim(width), clamp_dim(height)),
                stats: InputStats::default(),
            }),
        }
    }

    /// Open the injector; error if already running
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.active.is_some() {
            return Err(InputError::AlreadyRunning);
        }

        let injector = self.backend.open_injector()?;
        state.active = Some(ActiveInjection {
            injector,
            held_keys: HashSet::new(),
            held_keysyms: HashSet::new(),
            held_buttons: HashSet::new(),
        });
        info!("Input dispatcher started via {}", self.backend.name());
        Ok(())
    }

    /// Release held input and close the injector
    ///
    /// Idempotent; the dispatcher can be started again.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(mut active) = state.active.take() {
            release_held(&mut active);
            info!(
                "Input dispatcher stopped ({} injected, {} failed)",
                state.stats.injected, state.stats.failed
            );
        }
    }

    /// Whether the dispatcher is running
    pub fn is_running(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Set the bounds pointer coordinates are clamped to
    pub fn update_desktop_size(&self, width: u32, height: u32) {
        let mut state = self.state.lock();
        state.desktop = (clamp_dim(width), clamp_dim(height));
        debug!("Input bounds set to {}x{}", width, height);
    }

    /// Current clamping bounds
    pub fn desktop_size(&self) -> (u16, u16) {
        self.state.lock().desktop
    }

    /// Counters since creation
    pub fn stats(&self) -> InputStats {
        self.state.lock().stats
    }

    /// Route a protocol event to the matching operation
    pub fn dispatch(&self, event: &InputEvent) -> Result<()> {
        match *event {
            InputEvent::KeyboardScancode { flags, code } => self.keyboard_scancode(flags, code),
            InputEvent::KeyboardUnicode { flags, code_unit } => {
                self.keyboard_unicode(flags, code_unit)
            }
            InputEvent::Pointer { flags, x, y } => self.pointer(flags, x, y),
            InputEvent::ExtendedPointer { flags, x, y } => self.extended_pointer(flags, x, y),
        }
    }

    /// Inject a key by RDP scancode
    pub fn keyboard_scancode(&self, flags: KeyboardFlags, code: u16) -> Result<()> {
        let keycode = self.mapper.x11_keycode(
            code,
            flags.contains(KeyboardFlags::EXTENDED),
            flags.contains(KeyboardFlags::EXTENDED1),
        );
        let pressed = !flags.contains(KeyboardFlags::RELEASE);

        self.inject(|active| {
            let keycode = keycode?;
            trace!("Key {} {}", keycode, if pressed { "down" } else { "up" });
            active.injector.key(keycode, pressed)?;
            if pressed {
                active.held_keys.insert(keycode);
            } else {
                active.held_keys.remove(&keycode);
            }
            Ok(())
        })
    }

    /// Inject a character by UTF-16 code unit
    pub fn keyboard_unicode(&self, flags: KeyboardFlags, code_unit: u16) -> Result<()> {
        let pressed = !flags.contains(KeyboardFlags::RELEASE);

        self.inject(|active| {
            if (0xD800..=0xDFFF).contains(&code_unit) {
                return Err(InputError::UnsupportedCodeUnit(code_unit));
            }
            let keysym = unicode_to_keysym(code_unit as u32);
            trace!("Keysym 0x{:X} {}", keysym, if pressed { "down" } else { "up" });
            active.injector.keysym(keysym, pressed)?;
            if pressed {
                active.held_keysyms.insert(keysym);
            } else {
                active.held_keysyms.remove(&keysym);
            }
            Ok(())
        })
    }

    /// Inject a pointer move, button or wheel event
    pub fn pointer(&self, flags: PointerFlags, x: u16, y: u16) -> Result<()> {
        let (x, y) = self.clamp(x, y);

        self.inject(|active| {
            if flags.intersects(PointerFlags::WHEEL | PointerFlags::HWHEEL) {
                return scroll(active, flags);
            }

            let buttons = [
                (PointerFlags::BUTTON1, XButton::Left),
                (PointerFlags::BUTTON2, XButton::Right),
                (PointerFlags::BUTTON3, XButton::Middle),
            ];

            let has_button = buttons.iter().any(|(flag, _)| flags.contains(*flag));
            if flags.contains(PointerFlags::MOVE) || has_button {
                active.injector.pointer_motion(x, y)?;
            }

            let pressed = flags.contains(PointerFlags::DOWN);
            for (flag, button) in buttons {
                if flags.contains(flag) {
                    press_button(active, button, pressed)?;
                }
            }
            Ok(())
        })
    }

    /// Inject an extended (back/forward) button event
    pub fn extended_pointer(&self, flags: ExtendedPointerFlags, x: u16, y: u16) -> Result<()> {
        let (x, y) = self.clamp(x, y);
        let pressed = flags.contains(ExtendedPointerFlags::DOWN);

        self.inject(|active| {
            active.injector.pointer_motion(x, y)?;
            if flags.contains(ExtendedPointerFlags::BUTTON1) {
                press_button(active, XButton::Back, pressed)?;
            }
            if flags.contains(ExtendedPointerFlags::BUTTON2) {
                press_button(active, XButton::Forward, pressed)?;
            }
            Ok(())
        })
    }

    fn clamp(&self, x: u16, y: u16) -> (u16, u16) {
        let (width, height) = self.state.lock().desktop;
        (
            x.min(width.saturating_sub(1)),
            y.min(height.saturating_sub(1)),
        )
    }

    fn inject<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ActiveInjection) -> Result<()>,
    {
        let mut state = self.state.lock();
        let DispatcherState { active, stats, .. } = &mut *state;
        let active = active.as_mut().ok_or(InputError::NotRunning)?;

        let result = f(active);
        match &result {
            Ok(()) => stats.injected += 1,
            Err(e) => {
                stats.failed += 1;
                debug!("Input event rejected: {}", e);
            }
        }
        result
    }
}

impl Drop for InputDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scroll(active: &mut ActiveInjection, flags: PointerFlags) -> Result<()> {
    let rotation = flags.wheel_rotation();
    if rotation == 0 {
        return Ok(());
    }

    let button = match (flags.contains(PointerFlags::HWHEEL), rotation > 0) {
        (false, true) => XButton::WheelUp,
        (false, false) => XButton::WheelDown,
        (true, true) => XButton::WheelRight,
        (true, false) => XButton::WheelLeft,
    };

    let clicks = (rotation.abs() / WHEEL_DELTA).max(1);
    for _ in 0..clicks {
        active.injector.pointer_button(button.number(), true)?;
        active.injector.pointer_button(button.number(), false)?;
    }
    Ok(())
}

fn press_button(active: &mut ActiveInjection, button: XButton, pressed: bool) -> Result<()> {
    let number = button.number();
    active.injector.pointer_button(number, pressed)?;
    if pressed {
        active.held_buttons.insert(number);
    } else {
        active.held_buttons.remove(&number);
    }
    Ok(())
}

fn release_held(active: &mut ActiveInjection) {
    for keycode in active.held_keys.drain() {
        if let Err(e) = active.injector.key(keycode, false) {
            warn!("Failed to release key {}: {}", keycode, e);
        }
    }
    for keysym in active.held_keysyms.drain() {
        if let Err(e) = active.injector.keysym(keysym, false) {
            warn!("Failed to release keysym 0x{:X}: {}", keysym, e);
        }
    }
    for button in active.held_buttons.drain() {
        if let Err(e) = active.injector.pointer_button(button, false) {
            warn!("Failed to release button {}: {}", button, e);
        }
    }
}

fn clamp_dim(value: u32) -> u16 {
    value.clamp(1, u16::MAX as u32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureError, CaptureSource};
    use crate::input::MockInputInjector;
    use mockall::predicate::eq;
    use mockall::Sequence;

    struct MockBackend {
        injector: Mutex<Option<Arc<dyn InputInjector>>>,
    }

    impl DesktopBackend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        fn desktop_size(&self) -> (u32, u32) {
            (1280, 720)
        }

        fn open_capture(&self, _: u32, _: u32) -> std::result::Result<Box<dyn CaptureSource>, CaptureError> {
            Err(CaptureError::Unavailable("no capture in input tests".into()))
        }

        fn open_injector(&self) -> Result<Arc<dyn InputInjector>> {
            self.injector
                .lock()
                .take()
                .ok_or_else(|| InputError::Unavailable("injector already taken".into()))
        }
    }

    fn dispatcher(mock: MockInputInjector) -> InputDispatcher {
        let backend = Arc::new(MockBackend {
            injector: Mutex::new(Some(Arc::new(mock))),
        });
        let dispatcher = InputDispatcher::new(backend);
        dispatcher.start().unwrap();
        dispatcher
    }

    #[test]
    fn test_not_running_rejects_events() {
        let backend = Arc::new(MockBackend {
            injector: Mutex::new(None),
        });
        let dispatcher = InputDispatcher::new(backend);
        assert!(matches!(
            dispatcher.pointer(PointerFlags::MOVE, 1, 1),
            Err(InputError::NotRunning)
        ));
    }

    #[test]
    fn test_double_start_is_error() {
        let dispatcher = dispatcher(MockInputInjector::new());
        assert!(matches!(dispatcher.start(), Err(InputError::AlreadyRunning)));
    }

    #[test]
    fn test_scancode_press_and_release() {
        let mut mock = MockInputInjector::new();
        let mut seq = Sequence::new();
        mock.expect_key()
            .with(eq(38), eq(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_key()
            .with(eq(38), eq(false))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let dispatcher = dispatcher(mock);
        dispatcher.keyboard_scancode(KeyboardFlags::empty(), 0x1E).unwrap();
        dispatcher.keyboard_scancode(KeyboardFlags::RELEASE, 0x1E).unwrap();
        dispatcher.stop();
    }

    #[test]
    fn test_extended_scancode() {
        let mut mock = MockInputInjector::new();
        // Right Ctrl: evdev 97 + 8
        mock.expect_key()
            .with(eq(105), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_key()
            .with(eq(105), eq(false))
            .returning(|_, _| Ok(()));

        let dispatcher = dispatcher(mock);
        dispatcher.keyboard_scancode(KeyboardFlags::EXTENDED, 0x1D).unwrap();
    }

    #[test]
    fn test_unknown_scancode_does_not_stop_dispatcher() {
        let mut mock = MockInputInjector::new();
        mock.expect_pointer_motion()
            .with(eq(5), eq(5))
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = dispatcher(mock);
        assert!(dispatcher.keyboard_scancode(KeyboardFlags::empty(), 0x55).is_err());
        dispatcher.pointer(PointerFlags::MOVE, 5, 5).unwrap();
        assert!(dispatcher.is_running());
        assert_eq!(dispatcher.stats().failed, 1);
        assert_eq!(dispatcher.stats().injected, 1);
    }

    #[test]
    fn test_pointer_coordinates_clamped() {
        let mut mock = MockInputInjector::new();
        mock.expect_pointer_motion()
            .with(eq(1279), eq(719))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_pointer_motion()
            .with(eq(639), eq(10))
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = dispatcher(mock);
        dispatcher.pointer(PointerFlags::MOVE, 5000, 5000).unwrap();
        dispatcher.update_desktop_size(640, 480);
        dispatcher.pointer(PointerFlags::MOVE, 700, 10).unwrap();
    }

    #[test]
    fn test_right_button_maps_to_button_three() {
        let mut mock = MockInputInjector::new();
        mock.expect_pointer_motion().returning(|_, _| Ok(()));
        mock.expect_pointer_button()
            .with(eq(3), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_pointer_button()
            .with(eq(3), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = dispatcher(mock);
        dispatcher
            .pointer(PointerFlags::BUTTON2 | PointerFlags::DOWN, 10, 10)
            .unwrap();
        dispatcher.pointer(PointerFlags::BUTTON2, 10, 10).unwrap();
    }

    #[test]
    fn test_vertical_wheel_clicks() {
        let mut mock = MockInputInjector::new();
        // Two detents down: -240 = 0x110 in 9-bit two's complement
        mock.expect_pointer_button()
            .with(eq(5), eq(true))
            .times(2)
            .returning(|_, _| Ok(()));
        mock.expect_pointer_button()
            .with(eq(5), eq(false))
            .times(2)
            .returning(|_, _| Ok(()));

        let dispatcher = dispatcher(mock);
        let flags = PointerFlags::from_bits_retain(0x0200 | 0x0110);
        dispatcher.pointer(flags, 0, 0).unwrap();
    }

    #[test]
    fn test_horizontal_wheel_right() {
        let mut mock = MockInputInjector::new();
        mock.expect_pointer_button()
            .with(eq(7), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_pointer_button()
            .with(eq(7), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = dispatcher(mock);
        let flags = PointerFlags::from_bits_retain(0x0400 | 0x0078);
        dispatcher.pointer(flags, 0, 0).unwrap();
    }

    #[test]
    fn test_extended_buttons() {
        let mut mock = MockInputInjector::new();
        mock.expect_pointer_motion().returning(|_, _| Ok(()));
        mock.expect_pointer_button()
            .with(eq(8), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_pointer_button()
            .with(eq(9), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        // Both are released on stop
        mock.expect_pointer_button()
            .with(mockall::predicate::in_iter([8u8, 9u8]), eq(false))
            .times(2)
            .returning(|_, _| Ok(()));

        let dispatcher = dispatcher(mock);
        dispatcher
            .extended_pointer(
                ExtendedPointerFlags::BUTTON1 | ExtendedPointerFlags::DOWN,
                1,
                1,
            )
            .unwrap();
        dispatcher
            .extended_pointer(
                ExtendedPointerFlags::BUTTON2 | ExtendedPointerFlags::DOWN,
                1,
                1,
            )
            .unwrap();
        dispatcher.stop();
    }

    #[test]
    fn test_unicode_maps_to_keysym() {
        let mut mock = MockInputInjector::new();
        mock.expect_keysym()
            .with(eq(0x0100_20AC), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_keysym()
            .with(eq(0x0100_20AC), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = dispatcher(mock);
        dispatcher.keyboard_unicode(KeyboardFlags::empty(), 0x20AC).unwrap();
        dispatcher.keyboard_unicode(KeyboardFlags::RELEASE, 0x20AC).unwrap();
    }

    #[test]
    fn test_lone_surrogate_rejected() {
        let dispatcher = dispatcher(MockInputInjector::new());
        assert!(matches!(
            dispatcher.keyboard_unicode(KeyboardFlags::empty(), 0xD83D),
            Err(InputError::UnsupportedCodeUnit(0xD83D))
        ));
    }

    #[test]
    fn test_stop_releases_held_keys() {
        let mut mock = MockInputInjector::new();
        mock.expect_key()
            .with(eq(50), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_key()
            .with(eq(50), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = dispatcher(mock);
        // Left shift down, never released by the client
        dispatcher.keyboard_scancode(KeyboardFlags::empty(), 0x2A).unwrap();
        dispatcher.stop();
        assert!(!dispatcher.is_running());
    }

    #[test]
    fn test_dispatch_routes_events() {
        let mut mock = MockInputInjector::new();
        mock.expect_pointer_motion()
            .with(eq(42), eq(24))
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = dispatcher(mock);
        dispatcher.dispatch(&InputEvent::pointer_move(42, 24)).unwrap();
    }
}
