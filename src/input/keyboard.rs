//! xkb keymap handling for the input pipeline.

use xkbcommon::xkb;

/// Configuration for xkbcommon.
///
/// Fields left at `""`/`None` fall back to xkbcommon's environment
/// defaults (`XKB_DEFAULT_RULES` and friends).
#[derive(Clone, Debug, Default)]
pub struct XkbConfig<'a> {
    /// The rules file used to interpret the other fields.
    pub rules: &'a str,
    /// Keyboard model.
    pub model: &'a str,
    /// Comma separated list of layouts.
    pub layout: &'a str,
    /// Comma separated list of variants, one per layout.
    pub variant: &'a str,
    /// Comma separated list of options.
    pub options: Option<String>,
}

impl<'a> XkbConfig<'a> {
    pub(crate) fn compile_keymap(&self, context: &xkb::Context) -> Option<xkb::Keymap> {
        xkb::Keymap::new_from_names(
            context,
            self.rules,
            self.model,
            self.layout,
            self.variant,
            self.options.clone(),
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
    }
}

bitflags::bitflags! {
    /// Decoded modifier mask.
    ///
    /// Bit positions are a stable ABI shared with session clients; they
    /// mirror the classic X modifier numbering.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct Modifiers: u32 {
        /// Shift.
        const SHIFT = 1 << 0;
        /// Caps lock.
        const LOCK = 1 << 1;
        /// Control.
        const CONTROL = 1 << 2;
        /// Mod1, conventionally alt.
        const MOD1 = 1 << 3;
        /// Mod2, conventionally num lock.
        const MOD2 = 1 << 4;
        /// Mod3.
        const MOD3 = 1 << 5;
        /// Mod4, conventionally the logo key.
        const MOD4 = 1 << 6;
        /// Mod5.
        const MOD5 = 1 << 7;
    }
}

impl Modifiers {
    /// Shorthand for the ctrl+alt chord gating VT switch bindings.
    pub fn is_ctrl_alt(self) -> bool {
        self.contains(Modifiers::CONTROL | Modifiers::MOD1)
            && !self.intersects(Modifiers::SHIFT | Modifiers::MOD4)
    }
}

/// Maps effective xkb modifier names onto the stable mask.
///
/// `active` is queried once per relevant name, which keeps this testable
/// without compiling a real keymap.
pub(crate) fn modifiers_from<F>(active: F) -> Modifiers
where
    F: Fn(&str) -> bool,
{
    const NAMES: &[(&str, Modifiers)] = &[
        (xkb::MOD_NAME_SHIFT, Modifiers::SHIFT),
        (xkb::MOD_NAME_CAPS, Modifiers::LOCK),
        (xkb::MOD_NAME_CTRL, Modifiers::CONTROL),
        (xkb::MOD_NAME_ALT, Modifiers::MOD1),
        (xkb::MOD_NAME_NUM, Modifiers::MOD2),
        (xkb::MOD_NAME_LOGO, Modifiers::MOD4),
    ];

    let mut mods = Modifiers::empty();
    for &(name, bit) in NAMES {
        if active(name) {
            mods |= bit;
        }
    }
    mods
}

pub(crate) fn modifiers_of_state(state: &xkb::State) -> Modifiers {
    modifiers_from(|name| state.mod_name_is_active(name, xkb::STATE_MODS_EFFECTIVE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_mapping_is_total_and_stable() {
        let all = modifiers_from(|_| true);
        assert_eq!(
            all,
            Modifiers::SHIFT
                | Modifiers::LOCK
                | Modifiers::CONTROL
                | Modifiers::MOD1
                | Modifiers::MOD2
                | Modifiers::MOD4
        );

        let none = modifiers_from(|_| false);
        assert!(none.is_empty());

        let caps = modifiers_from(|name| name == xkb::MOD_NAME_CAPS);
        assert_eq!(caps, Modifiers::LOCK);
        let logo = modifiers_from(|name| name == xkb::MOD_NAME_LOGO);
        assert_eq!(logo, Modifiers::MOD4);
    }

    #[test]
    fn ctrl_alt_chord() {
        assert!((Modifiers::CONTROL | Modifiers::MOD1).is_ctrl_alt());
        assert!((Modifiers::CONTROL | Modifiers::MOD1 | Modifiers::MOD2).is_ctrl_alt());
        assert!(!(Modifiers::CONTROL | Modifiers::MOD1 | Modifiers::SHIFT).is_ctrl_alt());
        assert!(!Modifiers::CONTROL.is_ctrl_alt());
        assert!(!Modifiers::empty().is_ctrl_alt());
    }

    #[test]
    fn stable_bit_positions() {
        assert_eq!(Modifiers::SHIFT.bits(), 1);
        assert_eq!(Modifiers::LOCK.bits(), 2);
        assert_eq!(Modifiers::CONTROL.bits(), 4);
        assert_eq!(Modifiers::MOD1.bits(), 8);
        assert_eq!(Modifiers::MOD5.bits(), 128);
    }
}
