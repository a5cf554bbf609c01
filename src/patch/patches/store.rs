use log::info;

use crate::{
    assembly::{Anchor, Instruction, OpCode},
    metadata::token::Token,
    module::{Module, Transaction},
    patch::{
        guard::{Comparison, ConditionalGuard, GuardConstant, GuardSubject},
        Patch,
    },
    Error, Result,
};

/// Let purchases in virtual currency bypass the platform store.
///
/// On devices without Google Play services the store flow never completes, because both the
/// purchase coroutine and `StoreManager::RequestPurchase` route every purchase through the
/// platform billing API. The patch keeps that route for real-money purchases only:
///
/// - `StoreUI/<RunPurchaseFlow>c__Iterator81::MoveNext`: the `brfalse` at 0x47 becomes
///   `brtrue -> 0x4c`, followed by `if (this.currency == Real) goto 0x5b`
/// - `StoreManager::RequestPurchase`: after 0x11, `if (currency != Real) goto 0x35`
///
/// `Real` is read from `StoreManager/StoreCurrencyType` of the patched build. Both methods are
/// edited in one transaction and are either both patched or both left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePurchasePatch {
    /// Type owning `RequestPurchase` and the currency enum
    pub store_manager: String,
    /// Currency enum, nested in `store_manager`
    pub currency_type: String,
    /// Member of the currency enum that denotes real money
    pub real_member: String,
    /// Type owning the purchase coroutine
    pub store_ui: String,
    /// Product type the purchase flow operates on
    pub product_type: String,
    /// Compiler generated state machine of the purchase coroutine, nested in `store_ui`
    pub purchase_flow: String,
    /// Currency field of the state machine
    pub currency_field: String,
    /// Branch of `MoveNext` that is replaced
    pub purchase_branch: Anchor,
    /// Where the replacement branch goes
    pub next_comparison: Anchor,
    /// Where real-money purchases go
    pub real_purchase: Anchor,
    /// Name of the purchase request method
    pub request_purchase: String,
    /// Instruction of `RequestPurchase` the guard follows
    pub request_anchor: Anchor,
    /// Argument slot of the currency in `RequestPurchase`
    pub currency_argument: u16,
    /// Where `RequestPurchase` goes for anything but real money
    pub skip_platform_store: Anchor,
}

impl Default for StorePurchasePatch {
    fn default() -> Self {
        StorePurchasePatch {
            store_manager: "StoreManager".to_string(),
            currency_type: "StoreCurrencyType".to_string(),
            real_member: "Real".to_string(),
            store_ui: "StoreUI".to_string(),
            product_type: "Product".to_string(),
            purchase_flow: "<RunPurchaseFlow>c__Iterator81".to_string(),
            currency_field: "currency".to_string(),
            purchase_branch: Anchor::expecting(0x47, OpCode::BRFALSE_S),
            next_comparison: Anchor::at(0x4c),
            real_purchase: Anchor::at(0x5b),
            request_purchase: "RequestPurchase".to_string(),
            request_anchor: Anchor::at(0x11),
            currency_argument: 2,
            skip_platform_store: Anchor::at(0x35),
        }
    }
}

/// Methods and values found before staging
struct Targets {
    real: i32,
    move_next: Token,
    request_purchase: Token,
}

impl StorePurchasePatch {
    fn resolve(&self, module: &Module) -> Result<Targets> {
        let store_manager = module.find_type(&self.store_manager)?;
        let currency = module.find_nested_type(store_manager.token, &self.currency_type)?;
        if !module.is_enum(currency.token)? {
            return Err(Error::SymbolNotFound(format!(
                "enum {}, the type does not derive from System.Enum",
                currency.full_name
            )));
        }
        let real = module.find_field(currency.token, &self.real_member)?.as_i32()?;

        let store_ui = module.find_type(&self.store_ui)?;
        module.find_type(&self.product_type)?;
        let flow = module.find_nested_type(store_ui.token, &self.purchase_flow)?;
        let move_next = module.find_method_by_name(flow.token, "MoveNext")?;
        module.find_field(flow.token, &self.currency_field)?;
        info!("    MoveNext found: {}", move_next.qualified_name);

        let request_purchase =
            module.find_method_by_name(store_manager.token, &self.request_purchase)?;
        info!("    RequestPurchase found: {}", request_purchase.qualified_name);

        Ok(Targets {
            real,
            move_next: move_next.token,
            request_purchase: request_purchase.token,
        })
    }

    fn patch_store_ui(&self, tx: &mut Transaction<'_>, targets: &Targets) -> Result<()> {
        let module = tx.module();
        let mut editor = tx.editor(targets.move_next)?;

        let replaced = editor.locate(&self.purchase_branch)?;
        let next = editor.locate(&self.next_comparison)?;
        let index = editor
            .position(replaced)
            .ok_or_else(|| Error::AnchorInvalidated(editor.method().to_string()))?;

        let guard = ConditionalGuard::new(
            GuardSubject::ThisField(self.currency_field.clone()),
            GuardConstant::Literal(targets.real),
            Comparison::Equal,
            self.real_purchase,
        );
        editor.replace_at(index, Instruction::branch(OpCode::BRTRUE, next))?;
        guard.insert(module, &mut editor, index + 1)?;

        tx.replace_body(&editor)
    }

    fn patch_store_manager(&self, tx: &mut Transaction<'_>, targets: &Targets) -> Result<()> {
        let module = tx.module();
        let mut editor = tx.editor(targets.request_purchase)?;

        let anchor = editor.locate(&self.request_anchor)?;
        let index = editor
            .position(anchor)
            .ok_or_else(|| Error::AnchorInvalidated(editor.method().to_string()))?;

        let guard = ConditionalGuard::new(
            GuardSubject::Argument(self.currency_argument),
            GuardConstant::Literal(targets.real),
            Comparison::NotEqual,
            self.skip_platform_store,
        );
        guard.insert(module, &mut editor, index + 1)?;

        tx.replace_body(&editor)
    }
}

impl Patch for StorePurchasePatch {
    fn name(&self) -> &str {
        "Fix Store For Devices Without GMS"
    }

    fn apply(&self, module: &mut Module) -> Result<()> {
        let targets = self.resolve(module)?;

        module.transaction(|tx| {
            info!("  Patching {}...", self.store_ui);
            self.patch_store_ui(tx, &targets)?;
            info!("  Patching {}...", self.store_manager);
            self.patch_store_manager(tx, &targets)
        })
    }
}
